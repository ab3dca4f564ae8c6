//! Client configuration.
//!
//! A [`Config`] is built in code (usually `Config::new(api_key)` plus field
//! overrides) or loaded from the environment with [`Config::from_env`]. The
//! client calls [`Config::normalize`] before using it, so zero values fall
//! back to defaults and the server URL is derived from the zone.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::classifier::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_INTERVAL, DEFAULT_RETRY_THROTTLED_INTERVAL};
use crate::error::ConfigError;
use crate::event::{ExecuteResult, IngestionMetadata, Plan};
use crate::storage::{EventStorage, InMemoryEventStorage, DEFAULT_MAX_STORAGE_CAPACITY};
use crate::uploader::DEFAULT_CONNECTION_TIMEOUT;

/// HTTP API endpoint, US data center.
pub const US_HTTP_API_URL: &str = "https://api2.amplitude.com/2/httpapi";

/// HTTP API endpoint, EU data center.
pub const EU_HTTP_API_URL: &str = "https://api.eu.amplitude.com/2/httpapi";

/// Batch API endpoint, US data center.
pub const US_BATCH_API_URL: &str = "https://api2.amplitude.com/batch";

/// Batch API endpoint, EU data center.
pub const EU_BATCH_API_URL: &str = "https://api.eu.amplitude.com/batch";

/// Default time between automatic flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of events per upload.
pub const DEFAULT_FLUSH_QUEUE_SIZE: usize = 200;

/// Largest accepted `flush_queue_size`.
pub const MAX_FLUSH_QUEUE_SIZE: usize = 10_000;

/// Largest accepted flush interval when loading from the environment.
const MAX_FLUSH_INTERVAL_MS: u64 = 300_000;

/// Creates the storage for each destination.
pub type StorageFactory = Arc<dyn Fn() -> Box<dyn EventStorage> + Send + Sync>;

/// Receives the outcome of every event that leaves a destination.
pub type ExecuteCallback = Arc<dyn Fn(ExecuteResult) + Send + Sync>;

/// Data center receiving the events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerZone {
    #[default]
    US,
    EU,
}

impl ServerZone {
    /// Ingestion endpoint for the zone.
    pub fn server_url(&self, use_batch: bool) -> &'static str {
        match (self, use_batch) {
            (ServerZone::US, false) => US_HTTP_API_URL,
            (ServerZone::US, true) => US_BATCH_API_URL,
            (ServerZone::EU, false) => EU_HTTP_API_URL,
            (ServerZone::EU, true) => EU_BATCH_API_URL,
        }
    }
}

impl FromStr for ServerZone {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "US" => Ok(ServerZone::US),
            "EU" => Ok(ServerZone::EU),
            other => Err(format!("'{}' is not a server zone (expected US or EU)", other)),
        }
    }
}

/// Configuration shared by the client and all of its plugins.
#[derive(Clone)]
pub struct Config {
    pub api_key: String,

    /// Ingestion endpoint. Derived from `server_zone` and `use_batch` when empty.
    pub server_url: String,

    pub server_zone: ServerZone,

    /// Use the batch API instead of the HTTP API.
    pub use_batch: bool,

    pub flush_interval: Duration,

    /// Events per upload before any 413-driven shrinking.
    pub flush_queue_size: usize,

    /// Initial divider applied to `flush_queue_size`.
    pub flush_size_divider: usize,

    pub flush_max_retries: u32,

    pub connection_timeout: Duration,

    /// Bound on both the destination inbox and its storage.
    pub max_storage_capacity: usize,

    pub retry_base_interval: Duration,

    pub retry_throttled_interval: Duration,

    /// Minimum user/device id length accepted by the server.
    pub min_id_length: Option<u32>,

    /// Start with tracking disabled.
    pub opt_out: bool,

    pub storage_factory: Option<StorageFactory>,

    pub execute_callback: Option<ExecuteCallback>,

    /// Attached to events that carry no plan of their own.
    pub plan: Option<Plan>,

    /// Attached to events that carry no ingestion metadata of their own.
    pub ingestion_metadata: Option<IngestionMetadata>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            server_url: String::new(),
            server_zone: ServerZone::default(),
            use_batch: false,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_queue_size: DEFAULT_FLUSH_QUEUE_SIZE,
            flush_size_divider: 1,
            flush_max_retries: DEFAULT_MAX_RETRIES,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_storage_capacity: DEFAULT_MAX_STORAGE_CAPACITY,
            retry_base_interval: DEFAULT_RETRY_BASE_INTERVAL,
            retry_throttled_interval: DEFAULT_RETRY_THROTTLED_INTERVAL,
            min_id_length: None,
            opt_out: false,
            storage_factory: None,
            execute_callback: None,
            plan: None,
            ingestion_metadata: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &redact(&self.api_key))
            .field("server_url", &self.server_url)
            .field("server_zone", &self.server_zone)
            .field("use_batch", &self.use_batch)
            .field("flush_interval", &self.flush_interval)
            .field("flush_queue_size", &self.flush_queue_size)
            .field("flush_size_divider", &self.flush_size_divider)
            .field("flush_max_retries", &self.flush_max_retries)
            .field("connection_timeout", &self.connection_timeout)
            .field("max_storage_capacity", &self.max_storage_capacity)
            .field("retry_base_interval", &self.retry_base_interval)
            .field("retry_throttled_interval", &self.retry_throttled_interval)
            .field("min_id_length", &self.min_id_length)
            .field("opt_out", &self.opt_out)
            .field("storage_factory", &self.storage_factory.is_some())
            .field("execute_callback", &self.execute_callback.is_some())
            .field("plan", &self.plan)
            .field("ingestion_metadata", &self.ingestion_metadata)
            .finish()
    }
}

fn redact(api_key: &str) -> String {
    let count = api_key.chars().count();
    match count {
        0 => String::new(),
        1..=4 => "****".to_string(),
        _ => format!("****{}", api_key.chars().skip(count - 4).collect::<String>()),
    }
}

impl Config {
    /// Default configuration for the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Replace unset or zero values with defaults and derive the server URL.
    pub fn normalize(mut self) -> Self {
        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        if self.flush_queue_size == 0 {
            self.flush_queue_size = DEFAULT_FLUSH_QUEUE_SIZE;
        }
        if self.flush_size_divider == 0 {
            self.flush_size_divider = 1;
        }
        if self.flush_max_retries == 0 {
            self.flush_max_retries = DEFAULT_MAX_RETRIES;
        }
        if self.connection_timeout.is_zero() {
            self.connection_timeout = DEFAULT_CONNECTION_TIMEOUT;
        }
        if self.max_storage_capacity == 0 {
            self.max_storage_capacity = DEFAULT_MAX_STORAGE_CAPACITY;
        }
        if self.retry_base_interval.is_zero() {
            self.retry_base_interval = DEFAULT_RETRY_BASE_INTERVAL;
        }
        if self.retry_throttled_interval.is_zero() {
            self.retry_throttled_interval = DEFAULT_RETRY_THROTTLED_INTERVAL;
        }
        if self.server_url.is_empty() {
            self.server_url = self.server_zone.server_url(self.use_batch).to_string();
        }
        if self.storage_factory.is_none() {
            let capacity = self.max_storage_capacity;
            self.storage_factory = Some(Arc::new(move || {
                Box::new(InMemoryEventStorage::new(capacity)) as Box<dyn EventStorage>
            }));
        }
        self
    }

    /// Create a storage through the configured factory.
    pub fn create_storage(&self) -> Box<dyn EventStorage> {
        match &self.storage_factory {
            Some(factory) => factory(),
            None => Box::new(InMemoryEventStorage::new(self.max_storage_capacity)),
        }
    }

    /// Load configuration from `TELEMETRY_*` environment variables.
    ///
    /// Unset variables keep their defaults:
    /// - `TELEMETRY_API_KEY`
    /// - `TELEMETRY_SERVER_URL`
    /// - `TELEMETRY_SERVER_ZONE`: `US` or `EU`
    /// - `TELEMETRY_USE_BATCH`
    /// - `TELEMETRY_FLUSH_INTERVAL_MS`
    /// - `TELEMETRY_FLUSH_QUEUE_SIZE`
    /// - `TELEMETRY_FLUSH_MAX_RETRIES`
    /// - `TELEMETRY_CONNECTION_TIMEOUT_SECS`
    /// - `TELEMETRY_MAX_STORAGE_CAPACITY`
    /// - `TELEMETRY_MIN_ID_LENGTH`
    /// - `TELEMETRY_OPT_OUT`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the variable when a value does not parse
    /// or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(api_key) = env::var("TELEMETRY_API_KEY") {
            config.api_key = api_key;
        }

        if let Ok(url) = env::var("TELEMETRY_SERVER_URL") {
            config.server_url = url.trim().to_string();
        }

        if let Some(zone) = parse_var::<ServerZone>("TELEMETRY_SERVER_ZONE")? {
            config.server_zone = zone;
        }

        if let Some(use_batch) = parse_bool("TELEMETRY_USE_BATCH")? {
            config.use_batch = use_batch;
        }

        if let Some(ms) = parse_var::<u64>("TELEMETRY_FLUSH_INTERVAL_MS")? {
            if ms == 0 || ms > MAX_FLUSH_INTERVAL_MS {
                return Err(ConfigError::var(
                    "TELEMETRY_FLUSH_INTERVAL_MS",
                    format!("flush interval must be between 1 and {} ms", MAX_FLUSH_INTERVAL_MS),
                ));
            }
            config.flush_interval = Duration::from_millis(ms);
        }

        if let Some(size) = parse_var::<usize>("TELEMETRY_FLUSH_QUEUE_SIZE")? {
            if size == 0 {
                return Err(ConfigError::var(
                    "TELEMETRY_FLUSH_QUEUE_SIZE",
                    "flush queue size must be greater than 0",
                ));
            }
            if size > MAX_FLUSH_QUEUE_SIZE {
                return Err(ConfigError::var(
                    "TELEMETRY_FLUSH_QUEUE_SIZE",
                    format!(
                        "flush queue size {} exceeds maximum allowed ({})",
                        size, MAX_FLUSH_QUEUE_SIZE
                    ),
                ));
            }
            config.flush_queue_size = size;
        }

        if let Some(retries) = parse_var::<u32>("TELEMETRY_FLUSH_MAX_RETRIES")? {
            config.flush_max_retries = retries;
        }

        if let Some(secs) = parse_var::<u64>("TELEMETRY_CONNECTION_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(ConfigError::var(
                    "TELEMETRY_CONNECTION_TIMEOUT_SECS",
                    "connection timeout must be greater than 0",
                ));
            }
            config.connection_timeout = Duration::from_secs(secs);
        }

        if let Some(capacity) = parse_var::<usize>("TELEMETRY_MAX_STORAGE_CAPACITY")? {
            if capacity == 0 {
                return Err(ConfigError::var(
                    "TELEMETRY_MAX_STORAGE_CAPACITY",
                    "storage capacity must be greater than 0",
                ));
            }
            config.max_storage_capacity = capacity;
        }

        if let Some(length) = parse_var::<u32>("TELEMETRY_MIN_ID_LENGTH")? {
            config.min_id_length = Some(length);
        }

        if let Some(opt_out) = parse_bool("TELEMETRY_OPT_OUT")? {
            config.opt_out = opt_out;
        }

        Ok(config)
    }
}

fn parse_var<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::var(var, format!("'{}' is not valid: {}", value, e))),
        Err(_) => Ok(None),
    }
}

fn parse_bool(var: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::var(var, format!("'{}' is not a boolean", value))),
        },
        Err(_) => Ok(None),
    }
}
