//! Default destination: buffers events and uploads them in batches.
//!
//! `setup` spawns one worker task per destination. The worker owns the
//! storage, an auto-flush ticker and the receiving end of a bounded inbox.
//! Producers only ever `try_send` into the inbox, so tracking never waits on
//! the network: when the inbox is full the event is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::classifier::{ClassifierOptions, ClassifierResult, Clock, ResponseClassifier, SystemClock};
use crate::config::{Config, ExecuteCallback, DEFAULT_FLUSH_QUEUE_SIZE};
use crate::error::PluginError;
use crate::event::{Event, ExecuteResult, StorageEvent};
use crate::plugin::{DestinationPlugin, ExtendedDestinationPlugin, Plugin, PluginType};
use crate::storage::EventStorage;
use crate::uploader::{HttpUploader, Payload, PayloadOptions, Uploader};

/// Name reported by the default destination, in logs and callback results.
pub const DESTINATION_PLUGIN_NAME: &str = "amplitude";

/// Callback message for retryable events that no longer fit in storage.
pub const STORAGE_FULL_MESSAGE: &str = "Event dropped, storage is full";

/// Events per upload, shared between the plugin handle and its worker.
#[derive(Debug)]
struct ChunkSizing {
    flush_queue_size: usize,
    divider: AtomicUsize,
}

impl ChunkSizing {
    fn new(flush_queue_size: usize, divider: usize) -> Self {
        Self {
            flush_queue_size,
            divider: AtomicUsize::new(divider.max(1)),
        }
    }

    fn divider(&self) -> usize {
        self.divider.load(Ordering::Relaxed)
    }

    fn chunk_size(&self) -> usize {
        (self.flush_queue_size / self.divider()).max(1)
    }

    /// Bump the divider and return the new chunk size. Never undone.
    fn shrink(&self) -> usize {
        self.divider.fetch_add(1, Ordering::Relaxed);
        self.chunk_size()
    }
}

enum Message {
    Event(Event),
    Flush(oneshot::Sender<()>),
}

/// Batching destination posting to the ingestion API.
pub struct HttpDestination {
    uploader: Option<Arc<dyn Uploader>>,
    clock: Arc<dyn Clock>,
    sizing: Arc<ChunkSizing>,
    inbox: RwLock<Option<mpsc::Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for HttpDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDestination {
    pub fn new() -> Self {
        Self {
            uploader: None,
            clock: Arc::new(SystemClock),
            sizing: Arc::new(ChunkSizing::new(DEFAULT_FLUSH_QUEUE_SIZE, 1)),
            inbox: RwLock::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Use `uploader` instead of building an [`HttpUploader`] at setup.
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Use `clock` for storage due times and retry schedules.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current divider applied to the configured queue size.
    pub fn size_divider(&self) -> usize {
        self.sizing.divider()
    }

    /// Events per upload.
    pub fn chunk_size(&self) -> usize {
        self.sizing.chunk_size()
    }

    /// Returns `true` while the destination accepts events.
    pub fn is_running(&self) -> bool {
        self.inbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn flush_via(inbox: &mpsc::Sender<Message>) {
        let (done, finished) = oneshot::channel();
        if inbox.try_send(Message::Flush(done)).is_err() {
            debug!("Flush skipped, inbox full or closed");
            return;
        }
        // A dropped sender means the worker died; nothing left to wait for.
        let _ = finished.await;
    }
}

impl Plugin for HttpDestination {
    fn name(&self) -> &str {
        DESTINATION_PLUGIN_NAME
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Destination
    }

    fn setup(&mut self, config: &Config) -> Result<(), PluginError> {
        let runtime =
            Handle::try_current().map_err(|_| PluginError::NoRuntime(self.name().to_string()))?;

        let uploader: Arc<dyn Uploader> = match &self.uploader {
            Some(uploader) => Arc::clone(uploader),
            None => {
                let options = PayloadOptions {
                    min_id_length: config.min_id_length,
                };
                let uploader =
                    HttpUploader::new(&config.server_url, options, config.connection_timeout)
                        .map_err(|source| PluginError::HttpClient {
                            name: self.name().to_string(),
                            source,
                        })?;
                Arc::new(uploader)
            }
        };

        let classifier = ResponseClassifier::new(
            ClassifierOptions {
                max_retries: config.flush_max_retries,
                retry_base_interval: config.retry_base_interval,
                retry_throttled_interval: config.retry_throttled_interval,
            },
            Arc::clone(&self.clock),
        );

        let sizing = Arc::new(ChunkSizing::new(
            config.flush_queue_size,
            config.flush_size_divider,
        ));
        let (inbox, receiver) = mpsc::channel(config.max_storage_capacity.max(1));

        let worker = Worker {
            api_key: config.api_key.clone(),
            flush_interval: config.flush_interval.max(Duration::from_millis(1)),
            callback: config.execute_callback.clone(),
            storage: config.create_storage(),
            uploader,
            classifier,
            sizing: Arc::clone(&sizing),
            clock: Arc::clone(&self.clock),
        };

        info!(
            server_url = %config.server_url,
            chunk_size = sizing.chunk_size(),
            flush_interval_ms = worker.flush_interval.as_millis() as u64,
            "Destination started"
        );

        let handle = runtime.spawn(worker.run(receiver));

        self.sizing = sizing;
        self.inbox = RwLock::new(Some(inbox));
        self.worker = Mutex::new(Some(handle));
        Ok(())
    }
}

impl DestinationPlugin for HttpDestination {
    fn execute(&self, event: Event) {
        if !event.is_valid() {
            error!(
                event_type = %event.event_type,
                "Invalid event, event type and either user id or device id cannot be empty"
            );
        }

        let inbox = self.inbox.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(inbox) = inbox.as_ref() {
            if inbox.try_send(Message::Event(event)).is_err() {
                debug!("Inbox full or closed, dropping event");
            }
        }
    }
}

#[async_trait]
impl ExtendedDestinationPlugin for HttpDestination {
    async fn flush(&self) {
        let inbox = self
            .inbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(inbox) = inbox {
            Self::flush_via(&inbox).await;
        }
    }

    async fn shutdown(&self) {
        let inbox = self
            .inbox
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(inbox) = inbox else {
            return;
        };

        Self::flush_via(&inbox).await;
        drop(inbox);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Destination worker terminated abnormally");
            }
        }

        info!("Destination stopped");
    }
}

/// State owned by the worker task.
struct Worker {
    api_key: String,
    flush_interval: Duration,
    callback: Option<ExecuteCallback>,
    storage: Box<dyn EventStorage>,
    uploader: Arc<dyn Uploader>,
    classifier: ResponseClassifier,
    sizing: Arc<ChunkSizing>,
    clock: Arc<dyn Clock>,
}

impl Worker {
    async fn run(self, mut inbox: mpsc::Receiver<Message>) {
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain().await;
                    ticker.reset();
                }
                message = inbox.recv() => match message {
                    Some(Message::Event(event)) => {
                        self.storage.push_new(StorageEvent::new(event));
                        if self.storage.count(self.clock.now()) >= self.sizing.chunk_size() {
                            self.drain().await;
                            ticker.reset();
                        }
                    }
                    Some(Message::Flush(done)) => {
                        self.drain().await;
                        ticker.reset();
                        let _ = done.send(());
                    }
                    None => break,
                },
            }
        }

        debug!("Destination worker exiting");
    }

    /// Upload due events chunk by chunk until storage has nothing due.
    async fn drain(&self) {
        loop {
            let batch = self
                .storage
                .pull(self.sizing.chunk_size(), self.clock.now());
            if batch.is_empty() {
                break;
            }

            let batch_size = batch.len();
            let response = {
                let events = batch.iter().map(|stored| &stored.event).collect();
                self.uploader.send(Payload::new(&self.api_key, events)).await
            };
            let result = self.classifier.classify(batch, &response);

            let shrunk = result.should_shrink_chunk();
            if shrunk {
                let chunk_size = self.sizing.shrink();
                warn!(
                    chunk_size = chunk_size,
                    divider = self.sizing.divider(),
                    "Payload too large, reducing chunk size"
                );
            }

            // Only immediate retries and no resolved events: another pass now
            // would resend the same batch.
            let stalled = !shrunk
                && result.events_for_callback.is_empty()
                && result.events_for_retry.iter().all(|e| e.retry_at.is_none());

            debug!(
                batch_size = batch_size,
                disposition = ?result.disposition,
                delivered = result.events_for_callback.len(),
                retried = result.events_for_retry.len(),
                "Batch processed"
            );

            let ClassifierResult {
                code,
                message,
                events_for_callback,
                events_for_retry,
                ..
            } = result;

            if !events_for_retry.is_empty() {
                let rejected = self.storage.return_back(events_for_retry);
                self.deliver(code, STORAGE_FULL_MESSAGE.to_string(), rejected);
            }
            self.deliver(code, message, events_for_callback);

            if stalled {
                debug!("No progress on batch, waiting for next flush");
                break;
            }
        }
    }

    fn deliver(&self, code: i32, message: String, events: Vec<StorageEvent>) {
        let Some(callback) = self.callback.clone() else {
            return;
        };
        if events.is_empty() {
            return;
        }

        tokio::task::spawn_blocking(move || {
            for stored in events {
                callback(ExecuteResult {
                    plugin_name: DESTINATION_PLUGIN_NAME.to_string(),
                    event: stored.event,
                    code,
                    message: message.clone(),
                });
            }
        });
    }
}
