//! Greenhouse Collector Library
//!
//! Telemetry ingestion for a smart-farm greenhouse node:
//!
//! - **source**: Sensor sources (simulated channels and hardware readers)
//! - **buffer**: Bounded reading buffer with oldest-drop overflow
//! - **delivery**: Delivery client trait and the HTTP implementation
//! - **retry**: Exponential backoff and dead-lettering of failed batches
//! - **dead_letter**: Append-only sink for undeliverable batches
//! - **scheduler**: Periodic sampling and flushing with graceful shutdown
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use greenhouse_collector::buffer::SampleBuffer;
//! use greenhouse_collector::config::Config;
//! use greenhouse_collector::dead_letter::FileDeadLetterSink;
//! use greenhouse_collector::delivery::HttpDeliveryClient;
//! use greenhouse_collector::scheduler::{CollectionScheduler, SchedulerConfig};
//! use greenhouse_collector::source::default_rig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let sink = FileDeadLetterSink::open(&config.dead_letter_path).expect("Failed to open sink");
//!     let client = HttpDeliveryClient::new(&config).expect("Failed to create client");
//!
//!     let mut scheduler = CollectionScheduler::new(
//!         SchedulerConfig::from_config(&config),
//!         default_rig(),
//!         Arc::new(SampleBuffer::new(config.buffer_capacity)),
//!         Arc::new(client),
//!         Arc::new(sink),
//!     );
//!     scheduler
//!         .start(config.sampling_interval, config.flush_interval)
//!         .expect("Failed to start");
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     scheduler.stop().await;
//!     println!("{:?}", scheduler.metrics());
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod dead_letter;
pub mod delivery;
pub mod metrics;
pub mod reading;
pub mod retry;
pub mod scheduler;
pub mod source;

pub use buffer::{BufferStats, SampleBuffer};
pub use config::{Config, ConfigError};
pub use dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterSink, FileDeadLetterSink, MemoryDeadLetterSink,
};
pub use delivery::{ClientError, DeliveryClient, DeliveryResult, HttpDeliveryClient};
pub use metrics::{CollectorMetrics, MetricsSnapshot};
pub use reading::{Batch, Reading};
pub use retry::{deliver_with_retry, DeliveryOutcome, RetryPolicy};
pub use scheduler::{CollectionScheduler, SchedulerConfig, SchedulerError, SchedulerState};
pub use source::{
    ChannelReader, ChannelSpec, ChannelStatus, GreenhouseChannel, HardwareSource, ReadError,
    SensorSource, SimulatedSource,
};
