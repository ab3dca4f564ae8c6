//! HTTP uploader for event batches.
//!
//! One call to [`Uploader::send`] is exactly one POST. The uploader never
//! retries; retry policy lives in the destination worker and the response
//! classifier.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::TransportError;
use crate::event::Event;
use crate::response::UploadResponse;

/// Default per-request timeout.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Request options understood by the ingestion API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PayloadOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_id_length: Option<u32>,
}

impl PayloadOptions {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Body of a batch upload.
#[derive(Debug, Clone, Serialize)]
pub struct Payload<'a> {
    pub api_key: &'a str,
    pub events: Vec<&'a Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<PayloadOptions>,
}

impl<'a> Payload<'a> {
    pub fn new(api_key: &'a str, events: Vec<&'a Event>) -> Self {
        Self {
            api_key,
            events,
            options: None,
        }
    }
}

/// Sends one batch and reports what came back.
///
/// Failures are encoded in the returned [`UploadResponse`] rather than as an
/// `Err`, because the classifier needs the status and the error together.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn send(&self, payload: Payload<'_>) -> UploadResponse;
}

/// [`Uploader`] posting JSON to the ingestion endpoint with reqwest.
///
/// The underlying client is reused across calls so connections are pooled.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    server_url: String,
    options: Option<PayloadOptions>,
}

impl HttpUploader {
    /// Create an uploader for `server_url`.
    ///
    /// `options` are attached to every payload unless they are all unset.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the HTTP client cannot be built.
    pub fn new(
        server_url: impl Into<String>,
        options: PayloadOptions,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            server_url: server_url.into(),
            options: (!options.is_default()).then_some(options),
        })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn send(&self, mut payload: Payload<'_>) -> UploadResponse {
        if payload.events.is_empty() {
            return UploadResponse::default();
        }

        payload.options = self.options;
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, events = payload.events.len(), "Payload encoding failed");
                return UploadResponse::from_transport_error(TransportError::Encode(e.to_string()));
            }
        };

        debug!(
            url = %self.server_url,
            events = payload.events.len(),
            bytes = body.len(),
            "Sending event batch"
        );

        let response = match self
            .client
            .post(&self.server_url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "*/*")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return UploadResponse::from_transport_error(TransportError::request(e)),
        };

        let status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return UploadResponse {
                    status: Some(status),
                    transport_error: Some(TransportError::body(e)),
                    ..UploadResponse::default()
                };
            }
        };

        debug!(
            status = status,
            body = %String::from_utf8_lossy(&body),
            "Received upload response"
        );

        UploadResponse::from_body(&body, status)
    }
}
