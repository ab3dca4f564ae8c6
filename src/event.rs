//! Event records flowing through the pipeline.
//!
//! An [`Event`] is built by the caller, normalised by the client and then
//! cloned once per destination. Inside a destination it is wrapped in a
//! [`StorageEvent`] which carries the retry bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identify::IdentityOp;

/// Property operations keyed by identity operation (`$set`, `$add`, ...).
pub type IdentityProperties = BTreeMap<IdentityOp, Map<String, Value>>;

/// Tracking plan the event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(rename = "versionId", skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

/// Describes the system that ingested the event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
}

/// Optional attributes shared by every event kind.
///
/// Unset fields are omitted from the wire payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Milliseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_lat: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_lng: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_brand: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_manufacturer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dma: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idfa: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idfv: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub adid: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub android_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue: Option<f64>,

    #[serde(rename = "productId", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,

    #[serde(rename = "revenueType", skip_serializing_if = "Option::is_none")]
    pub revenue_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_metadata: Option<IngestionMetadata>,
}

impl EventOptions {
    /// Set the event time from a wall-clock timestamp.
    pub fn set_time(&mut self, time: DateTime<Utc>) {
        self.time = Some(time.timestamp_millis());
    }
}

/// A single analytics event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub event_type: String,

    #[serde(flatten)]
    pub options: EventOptions,

    #[serde(skip_serializing_if = "Map::is_empty")]
    pub event_properties: Map<String, Value>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub user_properties: IdentityProperties,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Vec<String>>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub group_properties: IdentityProperties,
}

impl Event {
    /// Create an event of the given type with no other attributes.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Self::default()
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.options.user_id = Some(user_id.into());
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.options.device_id = Some(device_id.into());
        self
    }

    pub fn with_options(mut self, options: EventOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a single event property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event_properties.insert(key.into(), value.into());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        non_empty(self.options.user_id.as_deref())
    }

    pub fn device_id(&self) -> Option<&str> {
        non_empty(self.options.device_id.as_deref())
    }

    /// Returns `true` if the event can be accepted by the ingestion API:
    /// it has a type and at least one of user id or device id.
    pub fn is_valid(&self) -> bool {
        !self.event_type.is_empty() && (self.user_id().is_some() || self.device_id().is_some())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// An event held by a destination's storage, with its retry state.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEvent {
    pub event: Event,

    /// Number of delivery attempts that ended in a retryable failure.
    pub retry_count: u32,

    /// When the event becomes eligible for another attempt.
    /// `None` places the event in the fresh lane.
    pub retry_at: Option<DateTime<Utc>>,
}

impl StorageEvent {
    /// Wrap a freshly ingested event.
    pub fn new(event: Event) -> Self {
        Self {
            event,
            retry_count: 0,
            retry_at: None,
        }
    }

    /// Returns `true` if the event can be pulled at `before`.
    pub fn is_due(&self, before: DateTime<Utc>) -> bool {
        match self.retry_at {
            None => true,
            Some(at) => at < before,
        }
    }
}

/// Outcome delivered to the execute callback for every event that leaves
/// a destination (successfully or not).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteResult {
    pub plugin_name: String,
    pub event: Event,
    pub code: i32,
    pub message: String,
}
