//! Panic boundaries around user plugins.
//!
//! Every plugin registered with the timeline is wrapped here. A plugin whose
//! setup panicked or failed is never shown an event. A panic in a before or
//! enrichment plugin lets the event through unchanged; a panic in a
//! destination loses only that destination's copy.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::config::Config;
use crate::error::PluginError;
use crate::event::Event;
use crate::plugin::{BeforePlugin, DestinationPlugin, EnrichmentPlugin, ExtendedDestinationPlugin};

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a plugin's setup. Returns `true` if it completed without error.
fn guarded_setup(name: &str, setup: impl FnOnce() -> Result<(), PluginError>) -> bool {
    match catch_unwind(AssertUnwindSafe(setup)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(plugin = %name, error = %e, "Plugin setup failed");
            false
        }
        Err(payload) => {
            error!(plugin = %name, panic = %panic_message(payload.as_ref()), "Panic in plugin setup");
            false
        }
    }
}

/// Run `execute` on a copy of `event`, falling back to the original on panic.
fn guarded_transform(
    name: &str,
    event: Event,
    execute: impl FnOnce(Event) -> Option<Event>,
) -> Option<Event> {
    let input = event.clone();
    match catch_unwind(AssertUnwindSafe(|| execute(input))) {
        Ok(result) => result,
        Err(payload) => {
            error!(plugin = %name, panic = %panic_message(payload.as_ref()), "Panic in plugin execute");
            Some(event)
        }
    }
}

pub struct SafeBeforePlugin {
    plugin: Box<dyn BeforePlugin>,
    initialised: bool,
}

impl SafeBeforePlugin {
    /// Wrap `plugin` and run its setup.
    pub fn new(mut plugin: Box<dyn BeforePlugin>, config: &Config) -> Self {
        let name = plugin.name().to_string();
        let initialised = guarded_setup(&name, || plugin.setup(config));
        Self { plugin, initialised }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn execute(&self, event: Event) -> Option<Event> {
        if !self.initialised {
            return Some(event);
        }
        guarded_transform(self.plugin.name(), event, |e| self.plugin.execute(e))
    }
}

pub struct SafeEnrichmentPlugin {
    plugin: Box<dyn EnrichmentPlugin>,
    initialised: bool,
}

impl SafeEnrichmentPlugin {
    pub fn new(mut plugin: Box<dyn EnrichmentPlugin>, config: &Config) -> Self {
        let name = plugin.name().to_string();
        let initialised = guarded_setup(&name, || plugin.setup(config));
        Self { plugin, initialised }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn execute(&self, event: Event) -> Option<Event> {
        if !self.initialised {
            return Some(event);
        }
        guarded_transform(self.plugin.name(), event, |e| self.plugin.execute(e))
    }
}

pub struct SafeDestinationPlugin {
    plugin: Box<dyn DestinationPlugin>,
    initialised: bool,
}

impl SafeDestinationPlugin {
    pub fn new(mut plugin: Box<dyn DestinationPlugin>, config: &Config) -> Self {
        let name = plugin.name().to_string();
        let initialised = guarded_setup(&name, || plugin.setup(config));
        Self { plugin, initialised }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn execute(&self, event: Event) {
        if !self.initialised {
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.plugin.execute(event))) {
            error!(
                plugin = %self.plugin.name(),
                panic = %panic_message(payload.as_ref()),
                "Panic in plugin execute"
            );
        }
    }
}

/// Wrapper for destinations that also flush and shut down.
///
/// `flush` and `shutdown` run the plugin on a separate task so that a panic
/// is observed as a failed join instead of unwinding through the caller.
pub struct SafeExtendedDestinationPlugin {
    name: String,
    plugin: Arc<dyn ExtendedDestinationPlugin>,
    initialised: bool,
}

impl SafeExtendedDestinationPlugin {
    pub fn new(mut plugin: Box<dyn ExtendedDestinationPlugin>, config: &Config) -> Self {
        let name = plugin.name().to_string();
        let initialised = guarded_setup(&name, || plugin.setup(config));
        Self {
            name,
            plugin: Arc::from(plugin),
            initialised,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn execute(&self, event: Event) {
        if !self.initialised {
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.plugin.execute(event))) {
            error!(
                plugin = %self.name,
                panic = %panic_message(payload.as_ref()),
                "Panic in plugin execute"
            );
        }
    }

    /// Start flushing the plugin. The work begins immediately; the returned
    /// future resolves once it is done.
    pub fn flush(&self) -> impl Future<Output = ()> + Send + 'static {
        self.spawn_guarded("flush", |plugin| async move { plugin.flush().await })
    }

    /// Start shutting the plugin down. The work begins immediately; the
    /// returned future resolves once it is done.
    pub fn shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        self.spawn_guarded("shutdown", |plugin| async move { plugin.shutdown().await })
    }

    fn spawn_guarded<F, Fut>(&self, operation: &'static str, op: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: FnOnce(Arc<dyn ExtendedDestinationPlugin>) -> Fut + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self
            .initialised
            .then(|| tokio::spawn(op(Arc::clone(&self.plugin))));
        let name = self.name.clone();

        async move {
            let Some(handle) = handle else {
                return;
            };
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(
                        plugin = %name,
                        panic = %panic_message(e.into_panic().as_ref()),
                        "Panic in plugin {}",
                        operation
                    );
                } else {
                    error!(plugin = %name, error = %e, "Plugin {} task failed", operation);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Plugin, PluginType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Faulty {
        panic_on_setup: bool,
        fail_on_setup: bool,
        panic_on_execute: bool,
        executed: Arc<AtomicUsize>,
        flushed: Arc<AtomicUsize>,
    }

    impl Plugin for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Enrichment
        }

        fn setup(&mut self, _config: &Config) -> Result<(), PluginError> {
            if self.panic_on_setup {
                panic!("setup exploded");
            }
            if self.fail_on_setup {
                return Err(PluginError::Setup("not today".to_string()));
            }
            Ok(())
        }
    }

    impl EnrichmentPlugin for Faulty {
        fn execute(&self, mut event: Event) -> Option<Event> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            event.event_type.push_str("-changed");
            if self.panic_on_execute {
                panic!("execute exploded");
            }
            Some(event)
        }
    }

    impl DestinationPlugin for Faulty {
        fn execute(&self, _event: Event) {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_execute {
                panic!("execute exploded");
            }
        }
    }

    #[async_trait]
    impl ExtendedDestinationPlugin for Faulty {
        async fn flush(&self) {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_execute {
                panic!("flush exploded");
            }
        }

        async fn shutdown(&self) {
            self.flush().await;
        }
    }

    fn config() -> Config {
        Config::new("key")
    }

    #[test]
    fn test_setup_panic_leaves_uninitialised() {
        let executed = Arc::new(AtomicUsize::new(0));
        let wrapper = SafeEnrichmentPlugin::new(
            Box::new(Faulty {
                panic_on_setup: true,
                executed: Arc::clone(&executed),
                ..Faulty::default()
            }),
            &config(),
        );

        assert!(!wrapper.is_initialised());
        let event = wrapper.execute(Event::new("click")).unwrap();
        assert_eq!(event.event_type, "click");
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_setup_error_leaves_uninitialised() {
        let wrapper = SafeEnrichmentPlugin::new(
            Box::new(Faulty {
                fail_on_setup: true,
                ..Faulty::default()
            }),
            &config(),
        );
        assert!(!wrapper.is_initialised());
    }

    #[test]
    fn test_execute_panic_returns_input_unchanged() {
        let wrapper = SafeEnrichmentPlugin::new(
            Box::new(Faulty {
                panic_on_execute: true,
                ..Faulty::default()
            }),
            &config(),
        );

        assert!(wrapper.is_initialised());
        let event = wrapper.execute(Event::new("click").with_user_id("u")).unwrap();
        assert_eq!(event.event_type, "click");
        assert_eq!(event.user_id(), Some("u"));
    }

    #[test]
    fn test_healthy_plugin_transforms_event() {
        let wrapper = SafeEnrichmentPlugin::new(Box::new(Faulty::default()), &config());
        let event = wrapper.execute(Event::new("click")).unwrap();
        assert_eq!(event.event_type, "click-changed");
    }

    #[test]
    fn test_destination_panic_is_contained() {
        let executed = Arc::new(AtomicUsize::new(0));
        let wrapper = SafeDestinationPlugin::new(
            Box::new(Faulty {
                panic_on_execute: true,
                executed: Arc::clone(&executed),
                ..Faulty::default()
            }),
            &config(),
        );

        wrapper.execute(Event::new("a"));
        wrapper.execute(Event::new("b"));
        assert_eq!(executed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_extended_flush_panic_is_contained() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let wrapper = SafeExtendedDestinationPlugin::new(
            Box::new(Faulty {
                panic_on_execute: true,
                flushed: Arc::clone(&flushed),
                ..Faulty::default()
            }),
            &config(),
        );

        wrapper.flush().await;
        wrapper.shutdown().await;
        assert_eq!(flushed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_uninitialised_extended_destination_is_inert() {
        let executed = Arc::new(AtomicUsize::new(0));
        let flushed = Arc::new(AtomicUsize::new(0));
        let wrapper = SafeExtendedDestinationPlugin::new(
            Box::new(Faulty {
                panic_on_setup: true,
                executed: Arc::clone(&executed),
                flushed: Arc::clone(&flushed),
                ..Faulty::default()
            }),
            &config(),
        );

        wrapper.execute(Event::new("a"));
        wrapper.flush().await;
        wrapper.shutdown().await;
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(flushed.load(Ordering::SeqCst), 0);
    }
}
