//! Client facade: the entry point applications track events through.
//!
//! A [`Client`] owns the plugin timeline and the opt-out gate. On creation
//! it registers the default batching destination and the context
//! before-plugin. Tracking never blocks on the network and never returns an
//! error: delivery outcomes are reported through `Config::execute_callback`.
//!
//! The client must be created inside a tokio runtime; the default
//! destination spawns its worker there.
//!
//! # Example
//!
//! ```no_run
//! use telemetry_pipeline::{Client, Config, Event};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new(Config::new("my-api-key"));
//!
//!     client.track(Event::new("Button Clicked").with_user_id("user-1"));
//!
//!     client.shutdown().await;
//! }
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::destination::HttpDestination;
use crate::event::{Event, EventOptions, ExecuteResult};
use crate::flag::AtomicFlag;
use crate::identify::{Identify, Revenue};
use crate::plugin::{AnyPlugin, ContextPlugin};
use crate::safe::panic_message;
use crate::timeline::Timeline;

/// Event type of identify events.
pub const IDENTIFY_EVENT_TYPE: &str = "$identify";

/// Event type of group identify events.
pub const GROUP_IDENTIFY_EVENT_TYPE: &str = "$groupidentify";

/// Event type of revenue events.
pub const REVENUE_EVENT_TYPE: &str = "revenue_amount";

pub struct Client {
    config: Config,
    opt_out: AtomicFlag,
    timeline: Timeline,
}

impl Client {
    /// Create a client with the default destination.
    pub fn new(config: Config) -> Self {
        Self::with_destination(config, HttpDestination::new())
    }

    /// Create a client using `destination` as its default destination, for
    /// example one built with a custom uploader.
    pub fn with_destination(config: Config, destination: HttpDestination) -> Self {
        let config = with_safe_callback(config.normalize());

        let client = Self {
            opt_out: AtomicFlag::new(config.opt_out),
            timeline: Timeline::new(config.clone()),
            config,
        };

        client.add(AnyPlugin::extended_destination(destination));
        client.add(AnyPlugin::before(ContextPlugin::new()));

        debug!(server_url = %client.config.server_url, "Client initialized");
        client
    }

    /// The normalized configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns `true` until the client is opted out or shut down.
    pub fn is_enabled(&self) -> bool {
        !self.opt_out.is_set()
    }

    pub fn track(&self, mut event: Event) {
        if !self.is_enabled() {
            return;
        }

        if event.options.plan.is_none() {
            event.options.plan = self.config.plan.clone();
        }
        if event.options.ingestion_metadata.is_none() {
            event.options.ingestion_metadata = self.config.ingestion_metadata.clone();
        }

        debug!(event_type = %event.event_type, "Track event");
        self.timeline.process(event);
    }

    /// Send an identify event updating user properties.
    pub fn identify(&self, identify: Identify, options: EventOptions) {
        if !self.is_enabled() {
            return;
        }

        let Some(identify) = validated("Identify", identify) else {
            return;
        };

        let mut event = Event::new(IDENTIFY_EVENT_TYPE).with_options(options);
        event.user_properties = identify.into_properties();
        self.track(event);
    }

    /// Send a group identify event updating the properties of one group.
    pub fn group_identify(
        &self,
        group_type: &str,
        group_name: &str,
        identify: Identify,
        options: EventOptions,
    ) {
        if !self.is_enabled() {
            return;
        }

        let Some(identify) = validated("Group identify", identify) else {
            return;
        };

        let mut event = Event::new(GROUP_IDENTIFY_EVENT_TYPE).with_options(options);
        event
            .groups
            .insert(group_type.to_string(), vec![group_name.to_string()]);
        event.group_properties = identify.into_properties();
        self.track(event);
    }

    /// Put the user in the named groups of `group_type`.
    pub fn set_group(&self, group_type: &str, group_names: Vec<String>, options: EventOptions) {
        if !self.is_enabled() {
            return;
        }

        let mut identify = Identify::new();
        identify.set(group_type, Value::from(group_names));
        self.identify(identify, options);
    }

    /// Send a `revenue_amount` event.
    pub fn revenue(&self, revenue: Revenue, options: EventOptions) {
        if !self.is_enabled() {
            return;
        }

        let errors = revenue.validate();
        if !errors.is_empty() {
            for message in errors {
                error!("Invalid Revenue: {}", message);
            }
            return;
        }

        let mut event = Event::new(REVENUE_EVENT_TYPE).with_options(options);
        event.event_properties = revenue.to_event_properties();
        self.track(event);
    }

    /// Deliver everything buffered by the destinations.
    pub async fn flush(&self) {
        self.timeline.flush().await;
    }

    /// Stop accepting events, then flush and stop every destination.
    pub async fn shutdown(&self) {
        self.opt_out.set();
        debug!("Client shutdown");
        self.timeline.shutdown().await;
    }

    /// Register a plugin. It is set up with this client's config.
    pub fn add(&self, plugin: AnyPlugin) {
        self.timeline.add(plugin);
    }

    /// Remove every plugin called `name`.
    pub fn remove(&self, name: &str) {
        self.timeline.remove(name);
    }

    /// Names of the registered plugins in pipeline order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.timeline.plugin_names()
    }
}

fn validated(kind: &str, identify: Identify) -> Option<Identify> {
    let (errors, warnings) = identify.validate();

    for message in warnings {
        warn!("{}: {}", kind, message);
    }

    if errors.is_empty() {
        return Some(identify);
    }

    for message in errors {
        error!("Invalid {}: {}", kind, message);
    }
    None
}

/// Wrap the execute callback so a panicking callback is logged, not propagated.
fn with_safe_callback(mut config: Config) -> Config {
    if let Some(callback) = config.execute_callback.take() {
        config.execute_callback = Some(Arc::new(move |result: ExecuteResult| {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(result))) {
                error!(panic = %panic_message(payload.as_ref()), "Panic in execute callback");
            }
        }));
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::DESTINATION_PLUGIN_NAME;
    use crate::event::{IngestionMetadata, Plan};
    use crate::identify::IdentityOp;
    use crate::plugin::{DestinationPlugin, Plugin, PluginType};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Capture {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Capture {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Plugin for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Destination
        }
    }

    impl DestinationPlugin for Capture {
        fn execute(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Client whose default destination is replaced by an in-memory capture.
    fn client_with(config: Config) -> (Client, Capture) {
        let client = Client::new(config);
        client.remove(DESTINATION_PLUGIN_NAME);
        let capture = Capture::default();
        client.add(AnyPlugin::destination(capture.clone()));
        (client, capture)
    }

    fn options_for(user_id: &str) -> EventOptions {
        EventOptions {
            user_id: Some(user_id.to_string()),
            ..EventOptions::default()
        }
    }

    #[tokio::test]
    async fn test_default_plugins_registered() {
        let client = Client::new(Config::new("key"));
        assert_eq!(client.plugin_names(), vec!["context", "amplitude"]);
        assert_eq!(client.config().server_url, "https://api2.amplitude.com/2/httpapi");
        client.remove(DESTINATION_PLUGIN_NAME);
    }

    #[tokio::test]
    async fn test_track_applies_context_and_config_defaults() {
        let plan = Plan {
            branch: Some("main".to_string()),
            ..Plan::default()
        };
        let metadata = IngestionMetadata {
            source_name: Some("cli".to_string()),
            ..IngestionMetadata::default()
        };
        let (client, capture) = client_with(Config {
            plan: Some(plan.clone()),
            ingestion_metadata: Some(metadata.clone()),
            ..Config::new("key")
        });

        client.track(Event::new("click").with_user_id("u1"));

        let events = capture.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].options.plan, Some(plan));
        assert_eq!(events[0].options.ingestion_metadata, Some(metadata));
        assert!(events[0].options.insert_id.is_some());
        assert!(events[0].options.time.is_some());
    }

    #[tokio::test]
    async fn test_opt_out_drops_events() {
        let (client, capture) = client_with(Config {
            opt_out: true,
            ..Config::new("key")
        });

        client.track(Event::new("click").with_user_id("u1"));
        assert!(!client.is_enabled());
        assert!(capture.events().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_tracking() {
        let (client, capture) = client_with(Config::new("key"));

        client.track(Event::new("before").with_user_id("u1"));
        client.shutdown().await;
        client.track(Event::new("after").with_user_id("u1"));

        let events = capture.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "before");
    }

    #[tokio::test]
    async fn test_identify_builds_identify_event() {
        let (client, capture) = client_with(Config::new("key"));

        let mut identify = Identify::new();
        identify.set("plan", "pro");
        client.identify(identify, options_for("u1"));

        let events = capture.events();
        assert_eq!(events[0].event_type, IDENTIFY_EVENT_TYPE);
        assert_eq!(events[0].user_id(), Some("u1"));
        assert_eq!(events[0].user_properties[&IdentityOp::Set]["plan"], json!("pro"));
    }

    #[tokio::test]
    async fn test_empty_identify_is_not_tracked() {
        let (client, capture) = client_with(Config::new("key"));
        client.identify(Identify::new(), options_for("u1"));
        assert!(capture.events().is_empty());
    }

    #[tokio::test]
    async fn test_group_identify_and_set_group() {
        let (client, capture) = client_with(Config::new("key"));

        let mut identify = Identify::new();
        identify.set("tier", "gold");
        client.group_identify("org", "acme", identify, options_for("u1"));
        client.set_group(
            "org",
            vec!["acme".to_string(), "globex".to_string()],
            options_for("u1"),
        );

        let events = capture.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, GROUP_IDENTIFY_EVENT_TYPE);
        assert_eq!(events[0].groups["org"], vec!["acme".to_string()]);
        assert_eq!(events[0].group_properties[&IdentityOp::Set]["tier"], json!("gold"));

        assert_eq!(events[1].event_type, IDENTIFY_EVENT_TYPE);
        assert_eq!(
            events[1].user_properties[&IdentityOp::Set]["org"],
            json!(["acme", "globex"])
        );
    }

    #[tokio::test]
    async fn test_revenue_event() {
        let (client, capture) = client_with(Config::new("key"));

        client.revenue(
            Revenue {
                price: 9.99,
                quantity: 2,
                product_id: "sku-1".to_string(),
                ..Revenue::default()
            },
            options_for("u1"),
        );
        client.revenue(Revenue::default(), options_for("u1"));

        let events = capture.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, REVENUE_EVENT_TYPE);
        assert_eq!(events[0].event_properties["$productId"], json!("sku-1"));
        assert_eq!(events[0].event_properties["$quantity"], json!(2));
        assert_eq!(events[0].event_properties["$price"], json!(9.99));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let config = with_safe_callback(Config {
            execute_callback: Some(Arc::new(|_result: ExecuteResult| panic!("callback exploded"))),
            ..Config::new("key")
        });

        let callback = config.execute_callback.unwrap();
        callback(ExecuteResult {
            plugin_name: "test".to_string(),
            event: Event::new("click"),
            code: 200,
            message: "ok".to_string(),
        });
    }
}
