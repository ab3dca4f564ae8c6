//! Builders for user/group property updates and revenue events.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::IdentityProperties;

/// Value recorded for `$unset` and `$clearAll` operations.
pub const UNSET_VALUE: &str = "-";

/// A property operation understood by the ingestion API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdentityOp {
    #[serde(rename = "$add")]
    Add,
    #[serde(rename = "$append")]
    Append,
    #[serde(rename = "$clearAll")]
    ClearAll,
    #[serde(rename = "$prepend")]
    Prepend,
    #[serde(rename = "$set")]
    Set,
    #[serde(rename = "$setOnce")]
    SetOnce,
    #[serde(rename = "$unset")]
    Unset,
    #[serde(rename = "$preInsert")]
    PreInsert,
    #[serde(rename = "$postInsert")]
    PostInsert,
    #[serde(rename = "$remove")]
    Remove,
}

impl IdentityOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityOp::Add => "$add",
            IdentityOp::Append => "$append",
            IdentityOp::ClearAll => "$clearAll",
            IdentityOp::Prepend => "$prepend",
            IdentityOp::Set => "$set",
            IdentityOp::SetOnce => "$setOnce",
            IdentityOp::Unset => "$unset",
            IdentityOp::PreInsert => "$preInsert",
            IdentityOp::PostInsert => "$postInsert",
            IdentityOp::Remove => "$remove",
        }
    }
}

impl std::fmt::Display for IdentityOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collects property operations for an identify or group identify event.
///
/// Conflicting operations are not recorded; each one leaves a warning that
/// the client logs when the identify is tracked.
///
/// ```
/// use telemetry_pipeline::identify::Identify;
///
/// let mut identify = Identify::new();
/// identify.set("plan", "pro").add("logins", 1);
/// assert!(identify.validate().0.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identify {
    properties: IdentityProperties,
    properties_set: HashSet<String>,
    warnings: Vec<String>,
}

impl Identify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value of a user property.
    pub fn set(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.record(IdentityOp::Set, property, value.into())
    }

    /// Set the value of a user property only if it has no value yet.
    pub fn set_once(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.record(IdentityOp::SetOnce, property, value.into())
    }

    /// Increment a numeric user property.
    pub fn add(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.record(IdentityOp::Add, property, value.into())
    }

    pub fn prepend(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.record(IdentityOp::Prepend, property, value.into())
    }

    pub fn append(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.record(IdentityOp::Append, property, value.into())
    }

    /// Insert value(s) at the start of a list property if not already present.
    pub fn pre_insert(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.record(IdentityOp::PreInsert, property, value.into())
    }

    /// Insert value(s) at the end of a list property if not already present.
    pub fn post_insert(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.record(IdentityOp::PostInsert, property, value.into())
    }

    pub fn remove(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.record(IdentityOp::Remove, property, value.into())
    }

    /// Remove the property from the profile.
    pub fn unset(&mut self, property: &str) -> &mut Self {
        self.record(IdentityOp::Unset, property, Value::from(UNSET_VALUE))
    }

    /// Remove every property of the profile.
    pub fn clear_all(&mut self) -> &mut Self {
        self.record(IdentityOp::ClearAll, UNSET_VALUE, Value::Null)
    }

    fn record(&mut self, op: IdentityOp, property: &str, value: Value) -> &mut Self {
        if let Some(warning) = self.conflict(op, property, &value) {
            self.warnings.push(warning);
            return self;
        }

        self.properties
            .entry(op)
            .or_default()
            .insert(property.to_string(), value);
        self.properties_set.insert(property.to_string());
        self
    }

    fn conflict(&self, op: IdentityOp, property: &str, value: &Value) -> Option<String> {
        if property.is_empty() {
            return Some(format!(
                "Attempting to perform operation {} with a null or empty string property, ignoring",
                op
            ));
        }

        if value.is_null() && op != IdentityOp::ClearAll {
            return Some(format!(
                "Attempting to perform operation {} with null value for property {}, ignoring",
                op, property
            ));
        }

        if self.properties.contains_key(&IdentityOp::ClearAll) {
            return Some(format!(
                "This Identify already contains a $clearAll operation, ignoring operation {} for property {}",
                op, property
            ));
        }

        if self.properties_set.contains(property) {
            return Some(format!(
                "Already used property {} in previous operation, ignoring operation {}",
                property, op
            ));
        }

        None
    }

    /// Returns `(errors, warnings)`. An identify with errors is not tracked.
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        if self.properties.is_empty() {
            errors.push("Empty Properties".to_string());
        }

        (errors, self.warnings.clone())
    }

    pub fn properties(&self) -> &IdentityProperties {
        &self.properties
    }

    pub fn into_properties(self) -> IdentityProperties {
        self.properties
    }
}

/// Event property keys used for revenue events.
pub mod revenue_keys {
    pub const PRODUCT_ID: &str = "$productId";
    pub const QUANTITY: &str = "$quantity";
    pub const PRICE: &str = "$price";
    pub const REVENUE_TYPE: &str = "$revenueType";
    pub const RECEIPT: &str = "$receipt";
    pub const RECEIPT_SIG: &str = "$receiptSig";
    pub const REVENUE: &str = "$revenue";
}

/// A purchase to be reported as a `revenue_amount` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Revenue {
    pub price: f64,

    /// Defaults to 1 when left at 0.
    pub quantity: u32,

    pub product_id: String,
    pub revenue_type: String,
    pub receipt: String,
    pub receipt_sig: String,

    /// Total revenue; overrides `price * quantity` on the server when set.
    pub revenue: f64,

    /// Extra event properties sent alongside the revenue fields.
    pub properties: Map<String, Value>,
}

impl Revenue {
    /// Returns the list of problems that prevent the revenue from being tracked.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.price == 0.0 && self.revenue == 0.0 {
            errors.push("Either price or revenue must be set".to_string());
        }

        if !self.price.is_finite() || !self.revenue.is_finite() {
            errors.push("Price and revenue must be finite numbers".to_string());
        }

        errors
    }

    /// Event properties carrying the revenue fields.
    pub fn to_event_properties(&self) -> Map<String, Value> {
        let quantity = if self.quantity == 0 { 1 } else { self.quantity };

        let mut properties = self.properties.clone();
        properties.insert(revenue_keys::PRODUCT_ID.into(), self.product_id.clone().into());
        properties.insert(revenue_keys::QUANTITY.into(), quantity.into());
        properties.insert(revenue_keys::PRICE.into(), self.price.into());
        properties.insert(revenue_keys::REVENUE_TYPE.into(), self.revenue_type.clone().into());
        properties.insert(revenue_keys::RECEIPT.into(), self.receipt.clone().into());
        properties.insert(revenue_keys::RECEIPT_SIG.into(), self.receipt_sig.clone().into());
        properties.insert(revenue_keys::REVENUE.into(), self.revenue.into());
        properties
    }
}
