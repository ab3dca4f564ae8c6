//! Telemetry Pipeline Library
//!
//! An analytics client that accepts events from application code, runs them
//! through a plugin pipeline and delivers them in batches to an HTTP
//! ingestion API with retries:
//!
//! - **client**: Facade for tracking events, identifies and revenue
//! - **timeline**: Ordered before / enrichment / destination plugin stages
//! - **safe**: Panic boundaries around user plugins
//! - **destination**: Batching worker with adaptive chunk sizing
//! - **storage**: Bounded two-lane (fresh / retry) event storage
//! - **uploader**: HTTP transport for event batches
//! - **classifier**: Maps upload responses to callback or retry
//! - **config**: Client configuration and environment loading
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use telemetry_pipeline::{Client, Config, Event, ExecuteResult};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = Config::new("my-api-key");
//!     config.execute_callback = Some(Arc::new(|result: ExecuteResult| {
//!         println!("{} -> {} {}", result.event.event_type, result.code, result.message);
//!     }));
//!
//!     let client = Client::new(config);
//!     client.track(Event::new("Song Played").with_user_id("user-42"));
//!
//!     // Deliver what is buffered and stop the background worker
//!     client.shutdown().await;
//! }
//! ```

// Module declarations
pub mod classifier;
pub mod client;
pub mod config;
pub mod destination;
pub mod error;
pub mod event;
pub mod flag;
pub mod identify;
pub mod plugin;
pub mod response;
pub mod safe;
pub mod storage;
pub mod timeline;
pub mod uploader;

// Re-export commonly used types at crate root for convenience
pub use classifier::{Clock, ResponseClassifier, SystemClock};
pub use client::Client;
pub use config::{Config, ServerZone};
pub use destination::HttpDestination;
pub use error::{ConfigError, PluginError, TransportError};
pub use event::{Event, EventOptions, ExecuteResult, IngestionMetadata, Plan, StorageEvent};
pub use identify::{IdentityOp, Identify, Revenue};
pub use plugin::{
    AnyPlugin, BeforePlugin, ContextPlugin, DestinationPlugin, EnrichmentPlugin,
    ExtendedDestinationPlugin, Plugin, PluginType,
};
pub use response::UploadResponse;
pub use storage::{EventStorage, InMemoryEventStorage};
pub use uploader::{HttpUploader, Payload, Uploader};
