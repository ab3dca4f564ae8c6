//! Plugin interfaces for the event pipeline.
//!
//! Events pass through before-plugins, then enrichment plugins, and are then
//! fanned out to every destination. Before/enrichment plugins may rewrite an
//! event or drop it by returning `None`. Destinations take ownership of their
//! own copy.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PluginError;
use crate::event::Event;

/// Library tag stamped on every event by the [`ContextPlugin`].
pub const LIBRARY_TAG: &str = concat!("telemetry-pipeline-rust/", env!("CARGO_PKG_VERSION"));

/// Stage a plugin declares it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginType {
    Before,
    Enrichment,
    Destination,
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginType::Before => write!(f, "before"),
            PluginType::Enrichment => write!(f, "enrichment"),
            PluginType::Destination => write!(f, "destination"),
        }
    }
}

/// Capabilities shared by every plugin.
pub trait Plugin: Send + Sync {
    /// Unique name within a client; used by `remove`.
    fn name(&self) -> &str;

    fn plugin_type(&self) -> PluginType;

    /// Called once before the plugin sees any event.
    fn setup(&mut self, _config: &Config) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Runs first; may rewrite or drop the event.
pub trait BeforePlugin: Plugin {
    fn execute(&self, event: Event) -> Option<Event>;
}

/// Runs after the before-plugins; may rewrite or drop the event.
pub trait EnrichmentPlugin: Plugin {
    fn execute(&self, event: Event) -> Option<Event>;
}

/// Receives its own copy of every event that made it through enrichment.
///
/// `execute` must not block: hand the event off and return.
pub trait DestinationPlugin: Plugin {
    fn execute(&self, event: Event);
}

/// A destination that buffers and therefore supports flushing.
#[async_trait]
pub trait ExtendedDestinationPlugin: DestinationPlugin {
    /// Deliver everything buffered so far.
    async fn flush(&self);

    /// Flush, then stop accepting events.
    async fn shutdown(&self);
}

/// A plugin tagged with the capability set it implements.
pub enum AnyPlugin {
    Before(Box<dyn BeforePlugin>),
    Enrichment(Box<dyn EnrichmentPlugin>),
    Destination(Box<dyn DestinationPlugin>),
    ExtendedDestination(Box<dyn ExtendedDestinationPlugin>),
}

impl AnyPlugin {
    pub fn before(plugin: impl BeforePlugin + 'static) -> Self {
        AnyPlugin::Before(Box::new(plugin))
    }

    pub fn enrichment(plugin: impl EnrichmentPlugin + 'static) -> Self {
        AnyPlugin::Enrichment(Box::new(plugin))
    }

    pub fn destination(plugin: impl DestinationPlugin + 'static) -> Self {
        AnyPlugin::Destination(Box::new(plugin))
    }

    pub fn extended_destination(plugin: impl ExtendedDestinationPlugin + 'static) -> Self {
        AnyPlugin::ExtendedDestination(Box::new(plugin))
    }

    pub fn name(&self) -> &str {
        match self {
            AnyPlugin::Before(p) => p.name(),
            AnyPlugin::Enrichment(p) => p.name(),
            AnyPlugin::Destination(p) => p.name(),
            AnyPlugin::ExtendedDestination(p) => p.name(),
        }
    }

    /// Type the plugin declares through [`Plugin::plugin_type`].
    pub fn declared_type(&self) -> PluginType {
        match self {
            AnyPlugin::Before(p) => p.plugin_type(),
            AnyPlugin::Enrichment(p) => p.plugin_type(),
            AnyPlugin::Destination(p) => p.plugin_type(),
            AnyPlugin::ExtendedDestination(p) => p.plugin_type(),
        }
    }

    /// Type implied by the implemented capability set.
    pub fn capability(&self) -> PluginType {
        match self {
            AnyPlugin::Before(_) => PluginType::Before,
            AnyPlugin::Enrichment(_) => PluginType::Enrichment,
            AnyPlugin::Destination(_) | AnyPlugin::ExtendedDestination(_) => PluginType::Destination,
        }
    }
}

impl std::fmt::Debug for AnyPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            AnyPlugin::Before(_) => "Before",
            AnyPlugin::Enrichment(_) => "Enrichment",
            AnyPlugin::Destination(_) => "Destination",
            AnyPlugin::ExtendedDestination(_) => "ExtendedDestination",
        };
        f.debug_struct("AnyPlugin")
            .field("kind", &kind)
            .field("name", &self.name())
            .finish()
    }
}

/// Before-plugin filling in the attributes every event needs: an insert id,
/// a timestamp and the library tag.
#[derive(Debug, Clone, Default)]
pub struct ContextPlugin;

impl ContextPlugin {
    pub const NAME: &'static str = "context";

    pub fn new() -> Self {
        Self
    }
}

impl Plugin for ContextPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Before
    }
}

impl BeforePlugin for ContextPlugin {
    fn execute(&self, mut event: Event) -> Option<Event> {
        let options = &mut event.options;

        if options.time.unwrap_or(0) == 0 {
            options.set_time(Utc::now());
        }

        if options.insert_id.as_deref().map_or(true, str::is_empty) {
            options.insert_id = Some(Uuid::new_v4().to_string());
        }

        options.library = Some(LIBRARY_TAG.to_string());
        Some(event)
    }
}
