//! Ordered plugin pipeline.
//!
//! `process` runs before-plugins, then enrichment plugins, then hands an
//! independent copy of the event to every destination. Adding or removing
//! plugins takes the write lock; everything else shares the read lock.

use std::sync::{PoisonError, RwLock};
use std::thread;

use tracing::{debug, error};

use crate::config::Config;
use crate::event::Event;
use crate::plugin::AnyPlugin;
use crate::safe::{
    SafeBeforePlugin, SafeDestinationPlugin, SafeEnrichmentPlugin, SafeExtendedDestinationPlugin,
};

enum Destination {
    Basic(SafeDestinationPlugin),
    Extended(SafeExtendedDestinationPlugin),
}

impl Destination {
    fn name(&self) -> &str {
        match self {
            Destination::Basic(p) => p.name(),
            Destination::Extended(p) => p.name(),
        }
    }

    fn execute(&self, event: Event) {
        match self {
            Destination::Basic(p) => p.execute(event),
            Destination::Extended(p) => p.execute(event),
        }
    }
}

#[derive(Default)]
struct Plugins {
    before: Vec<SafeBeforePlugin>,
    enrichment: Vec<SafeEnrichmentPlugin>,
    destinations: Vec<Destination>,
}

pub struct Timeline {
    config: Config,
    plugins: RwLock<Plugins>,
}

impl Timeline {
    /// Create an empty pipeline. `config` is passed to every plugin's setup.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            plugins: RwLock::new(Plugins::default()),
        }
    }

    /// Wrap `plugin`, run its setup and append it to its stage.
    ///
    /// A plugin whose declared type disagrees with the capability it was
    /// registered with is logged and skipped.
    pub fn add(&self, plugin: AnyPlugin) {
        let declared = plugin.declared_type();
        let capability = plugin.capability();
        if declared != capability {
            error!(
                plugin = %plugin.name(),
                declared = %declared,
                implemented = %capability,
                "Plugin does not implement the interface of its declared type, skipping"
            );
            return;
        }

        debug!(plugin = %plugin.name(), plugin_type = %declared, "Adding plugin");

        match plugin {
            AnyPlugin::Before(p) => {
                let wrapper = SafeBeforePlugin::new(p, &self.config);
                self.write().before.push(wrapper);
            }
            AnyPlugin::Enrichment(p) => {
                let wrapper = SafeEnrichmentPlugin::new(p, &self.config);
                self.write().enrichment.push(wrapper);
            }
            AnyPlugin::Destination(p) => {
                let wrapper = SafeDestinationPlugin::new(p, &self.config);
                self.write().destinations.push(Destination::Basic(wrapper));
            }
            AnyPlugin::ExtendedDestination(p) => {
                let wrapper = SafeExtendedDestinationPlugin::new(p, &self.config);
                self.write().destinations.push(Destination::Extended(wrapper));
            }
        }
    }

    /// Remove every plugin called `name`, whatever its stage.
    pub fn remove(&self, name: &str) {
        let mut plugins = self.write();
        plugins.before.retain(|p| p.name() != name);
        plugins.enrichment.retain(|p| p.name() != name);
        plugins.destinations.retain(|p| p.name() != name);
    }

    /// Names of the registered plugins in pipeline order.
    pub fn plugin_names(&self) -> Vec<String> {
        let plugins = self.read();
        plugins
            .before
            .iter()
            .map(|p| p.name().to_string())
            .chain(plugins.enrichment.iter().map(|p| p.name().to_string()))
            .chain(plugins.destinations.iter().map(|p| p.name().to_string()))
            .collect()
    }

    pub fn process(&self, event: Event) {
        let plugins = self.read();

        let Some(event) = plugins
            .before
            .iter()
            .try_fold(event, |event, plugin| plugin.execute(event))
        else {
            return;
        };

        let Some(event) = plugins
            .enrichment
            .iter()
            .try_fold(event, |event, plugin| plugin.execute(event))
        else {
            return;
        };

        match plugins.destinations.as_slice() {
            [] => {}
            [only] => only.execute(event),
            destinations => thread::scope(|scope| {
                for destination in destinations {
                    let copy = event.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("dispatch-{}", destination.name()))
                        .spawn_scoped(scope, move || destination.execute(copy));
                    if let Err(e) = spawned {
                        debug!(error = %e, "Dispatch thread unavailable, executing inline");
                        destination.execute(event.clone());
                    }
                }
            }),
        }
    }

    /// Flush every destination that supports it, concurrently.
    pub async fn flush(&self) {
        let pending: Vec<_> = {
            let plugins = self.read();
            plugins
                .destinations
                .iter()
                .filter_map(|d| match d {
                    Destination::Extended(p) => Some(p.flush()),
                    Destination::Basic(_) => None,
                })
                .collect()
        };

        for done in pending {
            done.await;
        }
    }

    /// Shut down every destination that supports it, concurrently.
    pub async fn shutdown(&self) {
        let pending: Vec<_> = {
            let plugins = self.read();
            plugins
                .destinations
                .iter()
                .filter_map(|d| match d {
                    Destination::Extended(p) => Some(p.shutdown()),
                    Destination::Basic(_) => None,
                })
                .collect()
        };

        for done in pending {
            done.await;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Plugins> {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Plugins> {
        self.plugins.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{
        BeforePlugin, DestinationPlugin, EnrichmentPlugin, ExtendedDestinationPlugin, Plugin,
        PluginType,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Tagger {
        name: &'static str,
        drop_type: Option<&'static str>,
    }

    impl Plugin for Tagger {
        fn name(&self) -> &str {
            self.name
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Before
        }
    }

    impl BeforePlugin for Tagger {
        fn execute(&self, event: Event) -> Option<Event> {
            if Some(event.event_type.as_str()) == self.drop_type {
                return None;
            }
            Some(event.with_property(self.name, true))
        }
    }

    struct Mutator;

    impl Plugin for Mutator {
        fn name(&self) -> &str {
            "mutator"
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Enrichment
        }
    }

    impl EnrichmentPlugin for Mutator {
        fn execute(&self, event: Event) -> Option<Event> {
            Some(event.with_property("enriched", 1))
        }
    }

    #[derive(Clone, Default)]
    struct Collector {
        name: &'static str,
        events: Arc<Mutex<Vec<Event>>>,
        flushes: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Plugin for Collector {
        fn name(&self) -> &str {
            self.name
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Destination
        }
    }

    impl DestinationPlugin for Collector {
        fn execute(&self, mut event: Event) {
            // Mutating the copy must not leak into other destinations.
            event.event_properties.insert(self.name.to_string(), true.into());
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl ExtendedDestinationPlugin for Collector {
        async fn flush(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn collector(name: &'static str) -> Collector {
        Collector {
            name,
            ..Collector::default()
        }
    }

    fn timeline() -> Timeline {
        Timeline::new(Config::new("key"))
    }

    #[test]
    fn test_process_runs_stages_in_order() {
        let timeline = timeline();
        let sink = collector("sink");
        timeline.add(AnyPlugin::before(Tagger { name: "first", drop_type: None }));
        timeline.add(AnyPlugin::enrichment(Mutator));
        timeline.add(AnyPlugin::destination(sink.clone()));

        timeline.process(Event::new("click"));

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_properties["first"], true);
        assert_eq!(events[0].event_properties["enriched"], 1);
    }

    #[test]
    fn test_before_plugin_can_drop_event() {
        let timeline = timeline();
        let sink = collector("sink");
        timeline.add(AnyPlugin::before(Tagger { name: "filter", drop_type: Some("noise") }));
        timeline.add(AnyPlugin::destination(sink.clone()));

        timeline.process(Event::new("noise"));
        timeline.process(Event::new("signal"));

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "signal");
    }

    #[test]
    fn test_destinations_receive_independent_copies() {
        let timeline = timeline();
        let a = collector("a");
        let b = collector("b");
        timeline.add(AnyPlugin::destination(a.clone()));
        timeline.add(AnyPlugin::destination(b.clone()));

        timeline.process(Event::new("click"));

        let a_events = a.events.lock().unwrap();
        let b_events = b.events.lock().unwrap();
        assert!(a_events[0].event_properties.contains_key("a"));
        assert!(!a_events[0].event_properties.contains_key("b"));
        assert!(b_events[0].event_properties.contains_key("b"));
        assert!(!b_events[0].event_properties.contains_key("a"));
    }

    #[test]
    fn test_mismatched_plugin_is_skipped() {
        let timeline = timeline();
        // Declares Destination but is registered as a before-plugin.
        timeline.add(AnyPlugin::before(Mislabeled));
        assert!(timeline.plugin_names().is_empty());
    }

    struct Mislabeled;

    impl Plugin for Mislabeled {
        fn name(&self) -> &str {
            "mislabeled"
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Destination
        }
    }

    impl BeforePlugin for Mislabeled {
        fn execute(&self, event: Event) -> Option<Event> {
            Some(event)
        }
    }

    #[test]
    fn test_remove_drops_every_plugin_with_name() {
        let timeline = timeline();
        timeline.add(AnyPlugin::before(Tagger { name: "dup", drop_type: None }));
        timeline.add(AnyPlugin::destination(collector("dup")));
        timeline.add(AnyPlugin::destination(collector("keep")));
        assert_eq!(timeline.plugin_names(), vec!["dup", "dup", "keep"]);

        timeline.remove("dup");
        assert_eq!(timeline.plugin_names(), vec!["keep"]);
    }

    #[tokio::test]
    async fn test_flush_and_shutdown_reach_extended_destinations() {
        let timeline = timeline();
        let basic = collector("basic");
        let extended_a = collector("ext-a");
        let extended_b = collector("ext-b");
        timeline.add(AnyPlugin::destination(basic.clone()));
        timeline.add(AnyPlugin::extended_destination(extended_a.clone()));
        timeline.add(AnyPlugin::extended_destination(extended_b.clone()));

        timeline.flush().await;
        timeline.shutdown().await;

        assert_eq!(basic.flushes.load(Ordering::SeqCst), 0);
        assert_eq!(extended_a.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(extended_b.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(extended_a.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(extended_b.shutdowns.load(Ordering::SeqCst), 1);
    }
}
