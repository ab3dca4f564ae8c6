//! Decoded ingestion API response.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::TransportError;
use crate::event::Event;

/// Transport status reduced to the classes the classifier dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizedStatus {
    /// Any 2xx.
    Success,
    /// Any 4xx not listed below.
    BadRequest,
    /// 408.
    RequestTimeout,
    /// 413.
    PayloadTooLarge,
    /// 429.
    TooManyRequests,
    /// Any 5xx.
    ServerError,
    /// No status, or a status outside the ranges above.
    Unknown,
}

impl NormalizedStatus {
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(200..=299) => NormalizedStatus::Success,
            Some(408) => NormalizedStatus::RequestTimeout,
            Some(413) => NormalizedStatus::PayloadTooLarge,
            Some(429) => NormalizedStatus::TooManyRequests,
            Some(400..=499) => NormalizedStatus::BadRequest,
            Some(500..=u16::MAX) => NormalizedStatus::ServerError,
            _ => NormalizedStatus::Unknown,
        }
    }
}

/// Response of one batch upload.
///
/// The body fields are decoded leniently: unknown fields are ignored and a
/// body that is not valid JSON leaves every field at its default. `status`
/// and `transport_error` are filled in by the uploader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadResponse {
    /// HTTP status code; `None` if no response was received.
    #[serde(skip)]
    pub status: Option<u16>,

    #[serde(skip)]
    pub transport_error: Option<TransportError>,

    #[serde(deserialize_with = "null_as_default")]
    pub code: i32,

    #[serde(deserialize_with = "null_as_default")]
    pub error: String,

    #[serde(deserialize_with = "null_as_default")]
    pub missing_field: String,

    #[serde(deserialize_with = "null_as_default")]
    pub events_with_invalid_fields: HashMap<String, Vec<usize>>,

    #[serde(deserialize_with = "null_as_default")]
    pub events_with_missing_fields: HashMap<String, Vec<usize>>,

    #[serde(deserialize_with = "null_as_default")]
    pub events_with_invalid_id_lengths: HashMap<String, Vec<usize>>,

    #[serde(deserialize_with = "null_as_default")]
    pub silenced_events: Vec<usize>,

    #[serde(deserialize_with = "null_as_default")]
    pub throttled_events: Vec<usize>,

    #[serde(deserialize_with = "null_as_default")]
    pub exceeded_daily_quota_users: HashMap<String, i64>,

    #[serde(deserialize_with = "null_as_default")]
    pub exceeded_daily_quota_devices: HashMap<String, i64>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl UploadResponse {
    /// Decode a response body, falling back to an empty response when the
    /// body is not a JSON object of the expected shape.
    pub fn from_body(body: &[u8], status: u16) -> Self {
        let mut response: UploadResponse = serde_json::from_slice(body).unwrap_or_default();
        response.status = Some(status);
        response
    }

    /// A response for a request that never produced a status line.
    pub fn from_transport_error(err: TransportError) -> Self {
        Self {
            transport_error: Some(err),
            ..Self::default()
        }
    }

    pub fn normalized_status(&self) -> NormalizedStatus {
        NormalizedStatus::from_status(self.status)
    }

    /// Batch indices rejected as invalid, missing fields, bad id length or silenced.
    pub fn invalid_or_silenced_indices(&self) -> HashSet<usize> {
        self.events_with_missing_fields
            .values()
            .chain(self.events_with_invalid_fields.values())
            .chain(self.events_with_invalid_id_lengths.values())
            .flatten()
            .chain(self.silenced_events.iter())
            .copied()
            .collect()
    }

    pub fn is_throttled(&self, index: usize) -> bool {
        self.throttled_events.contains(&index)
    }

    /// Returns `true` if the event's user or device is over its daily quota.
    pub fn exceeded_daily_quota(&self, event: &Event) -> bool {
        let user_exceeded = event
            .user_id()
            .is_some_and(|id| self.exceeded_daily_quota_users.contains_key(id));
        let device_exceeded = event
            .device_id()
            .is_some_and(|id| self.exceeded_daily_quota_devices.contains_key(id));

        user_exceeded || device_exceeded
    }
}
