//! Error types for the pipeline.
//!
//! None of these reach the code that tracks events: delivery failures are
//! reported through the execute callback.

use thiserror::Error;

/// Failure below the HTTP status line while uploading a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The payload could not be serialized.
    #[error("can't encode payload: {0}")]
    Encode(String),

    /// The request could not be built (bad URL, bad header).
    #[error("can't build new request: {0}")]
    Build(String),

    /// Connecting or sending failed.
    #[error("HTTP request failed: {message}")]
    Request { message: String, timeout: bool },

    /// The response body could not be read.
    #[error("can't read HTTP response body: {message}")]
    Body { message: String, timeout: bool },
}

impl TransportError {
    /// Returns `true` if the failure was caused by the connection timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Request { timeout, .. } | TransportError::Body { timeout, .. } => {
                *timeout
            }
            TransportError::Encode(_) | TransportError::Build(_) => false,
        }
    }

    pub(crate) fn request(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return TransportError::Build(err.to_string());
        }

        TransportError::Request {
            timeout: err.is_timeout(),
            message: err.to_string(),
        }
    }

    pub(crate) fn body(err: reqwest::Error) -> Self {
        TransportError::Body {
            timeout: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

/// Failure reported by a plugin's setup.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin needs a tokio runtime and none is running.
    #[error("plugin {0} must be set up from within a tokio runtime")]
    NoRuntime(String),

    /// The plugin's HTTP client could not be constructed.
    #[error("plugin {name} failed to build its HTTP client: {source}")]
    HttpClient {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// Any other setup failure.
    #[error("plugin setup failed: {0}")]
    Setup(String),
}

/// Error type for configuration loading failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Configuration error for {var}: {message}")]
    InvalidVar { var: String, message: String },
}

impl ConfigError {
    pub(crate) fn var(var: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidVar {
            var: var.to_string(),
            message: message.into(),
        }
    }

    /// The environment variable at fault.
    pub fn env_var(&self) -> &str {
        match self {
            ConfigError::InvalidVar { var, .. } => var,
        }
    }
}
