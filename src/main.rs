//! Greenhouse Collector - telemetry service for a smart-farm greenhouse node
//!
//! Samples the greenhouse sensors on a fixed interval, buffers the readings
//! and delivers them in batches to the farm's ingest endpoint.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `FARM_COLLECTOR_ENDPOINT_URL`: Ingest endpoint (default: http://localhost:8000/api/v1/telemetry/batches)
//! - `FARM_COLLECTOR_SAMPLING_INTERVAL_MS`: Milliseconds between samples (default: 5000)
//! - `FARM_COLLECTOR_FLUSH_INTERVAL_MS`: Milliseconds between flushes (default: 5000)
//! - `FARM_COLLECTOR_BUFFER_CAPACITY`: Readings held before oldest-drop (default: 1000)
//! - `FARM_COLLECTOR_MAX_BATCH_SIZE`: Readings per batch (default: 200)
//! - `FARM_COLLECTOR_MAX_RETRY_ATTEMPTS`: Retries per batch (default: 5)
//! - `FARM_COLLECTOR_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
//! - `FARM_COLLECTOR_SHUTDOWN_TIMEOUT_SECS`: Final flush budget (default: 5)
//! - `FARM_COLLECTOR_DEAD_LETTER_PATH`: Dead-letter file (default: dead-letter.jsonl)
//! - `FARM_COLLECTOR_ID`: Collector id attached to batches (default: greenhouse-collector)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use greenhouse_collector::buffer::SampleBuffer;
use greenhouse_collector::config::Config;
use greenhouse_collector::dead_letter::FileDeadLetterSink;
use greenhouse_collector::delivery::HttpDeliveryClient;
use greenhouse_collector::scheduler::{CollectionScheduler, SchedulerConfig};
use greenhouse_collector::source::default_rig;

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting greenhouse collector...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint_url = %config.endpoint_url,
                sampling_interval_ms = config.sampling_interval.as_millis() as u64,
                flush_interval_ms = config.flush_interval.as_millis() as u64,
                buffer_capacity = config.buffer_capacity,
                max_batch_size = config.max_batch_size,
                max_retry_attempts = config.max_retry_attempts,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let dead_letters = match FileDeadLetterSink::open(&config.dead_letter_path) {
        Ok(sink) => {
            info!(path = %sink.path().display(), "Dead-letter sink opened");
            Arc::new(sink)
        }
        Err(e) => {
            error!(error = %e, "Failed to open dead-letter sink");
            std::process::exit(1);
        }
    };

    let client = match HttpDeliveryClient::new(&config) {
        Ok(client) => {
            info!(endpoint_url = %client.endpoint_url(), "HTTP client initialized");
            Arc::new(client)
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let mut scheduler = CollectionScheduler::new(
        SchedulerConfig::from_config(&config),
        default_rig(),
        Arc::new(SampleBuffer::new(config.buffer_capacity)),
        client,
        dead_letters,
    );

    if let Err(e) = scheduler.start(config.sampling_interval, config.flush_interval) {
        error!(error = %e, "Failed to start scheduler");
        std::process::exit(1);
    }

    info!("Greenhouse collector running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    scheduler.stop().await;

    let metrics = scheduler.metrics();
    match serde_json::to_string(&metrics) {
        Ok(json) => info!(metrics = %json, "Final metrics"),
        Err(_) => info!(?metrics, "Final metrics"),
    }

    info!("Greenhouse collector stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
