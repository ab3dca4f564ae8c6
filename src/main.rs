//! Telemetry Pipeline - forwards newline-delimited JSON events to the ingestion API
//!
//! Each line read from stdin is decoded as an event and tracked. The
//! outcome of every event is logged once its batch has been classified.
//! On end of input or Ctrl+C the client flushes and shuts down.
//!
//! ## Configuration
//!
//! Configuration is loaded from `TELEMETRY_*` environment variables (see
//! `Config::from_env`), for example:
//!
//! - `TELEMETRY_API_KEY`: project API key (required)
//! - `TELEMETRY_SERVER_ZONE`: `US` or `EU` (default: US)
//! - `TELEMETRY_FLUSH_INTERVAL_MS`: milliseconds between flushes (default: 10000)
//! - `TELEMETRY_FLUSH_QUEUE_SIZE`: events per upload (default: 200)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_pipeline::{Client, Config, Event, ExecuteResult};

/// Upper bound on the final flush at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting telemetry pipeline...");

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    if config.api_key.is_empty() {
        error!("TELEMETRY_API_KEY must be set");
        std::process::exit(1);
    }

    config.execute_callback = Some(Arc::new(log_result));

    let client = Client::new(config);
    info!(
        server_url = %client.config().server_url,
        flush_queue_size = client.config().flush_queue_size,
        flush_interval_ms = client.config().flush_interval.as_millis() as u64,
        "Configuration loaded"
    );

    tokio::select! {
        tracked = read_events(&client) => {
            info!(events = tracked, "End of input reached");
        }
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    info!("Initiating graceful shutdown...");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, client.shutdown())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
    }

    info!("Telemetry pipeline stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Track every event line from stdin. Returns the number of tracked events.
async fn read_events(client: &Client) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tracked: u64 = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read from stdin");
                break;
            }
        };

        match parse_event(&line) {
            Some(Ok(event)) => {
                client.track(event);
                tracked += 1;
            }
            Some(Err(e)) => warn!(error = %e, "Skipping malformed event line"),
            None => {}
        }
    }

    tracked
}

/// Decode one input line. Blank lines yield `None`.
fn parse_event(line: &str) -> Option<Result<Event, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

fn log_result(result: ExecuteResult) {
    if (200..300).contains(&result.code) {
        info!(
            plugin = %result.plugin_name,
            event_type = %result.event.event_type,
            insert_id = ?result.event.options.insert_id,
            code = result.code,
            "{}",
            result.message
        );
    } else {
        warn!(
            plugin = %result.plugin_name,
            event_type = %result.event.event_type,
            insert_id = ?result.event.options.insert_id,
            code = result.code,
            "{}",
            result.message
        );
    }
}
