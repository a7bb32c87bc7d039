//! Collection scheduler: drives sampling and delivery.
//!
//! Two independent tokio tasks run while the scheduler is `Running`:
//!
//! - the sampling task samples every source each `sampling_interval` and
//!   pushes the readings into the [`SampleBuffer`]
//! - the flush task drains the buffer each `flush_interval` and delivers
//!   the batches through [`deliver_with_retry`]
//!
//! The tasks share nothing except the buffer and the metrics counters.
//! Batches are delivered one at a time so readings of a channel reach the
//! endpoint in capture order. `stop` cancels both tasks, performs one
//! bounded final flush and dead-letters whatever it could not deliver.
//! A scheduler dropped without a completed `stop` dead-letters whatever is
//! still pending.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::SampleBuffer;
use crate::config::Config;
use crate::dead_letter::DeadLetterSink;
use crate::delivery::{DeliveryClient, DeliveryResult};
use crate::metrics::{CollectorMetrics, MetricsSnapshot};
use crate::reading::Batch;
use crate::retry::{deliver_with_retry, give_up, DeliveryOutcome, RetryPolicy};
use crate::source::{ChannelStatus, GreenhouseChannel, SensorSource};

/// Interval between sampling progress reports
const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle of a [`CollectionScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::Stopping => write!(f, "stopping"),
            SchedulerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors returned by [`CollectionScheduler::start`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler can only start from idle, current state is {0}")]
    InvalidState(SchedulerState),

    #[error("{0} interval must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Delivery and shutdown settings for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_batch_size: usize,
    pub shutdown_timeout: Duration,
    pub retry: RetryPolicy,

    /// Tag attached to every batch
    pub collector_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 200,
            shutdown_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            collector_id: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            shutdown_timeout: config.shutdown_timeout,
            retry: config.retry_policy(),
            collector_id: Some(config.collector_id.clone()),
        }
    }
}

/// State shared by the flush task and the final flush.
struct FlushContext<D: DeliveryClient> {
    buffer: Arc<SampleBuffer>,
    client: Arc<D>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<CollectorMetrics>,
    max_batch_size: usize,
    collector_id: Option<String>,
}

impl<D: DeliveryClient> Clone for FlushContext<D> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            client: self.client.clone(),
            dead_letters: self.dead_letters.clone(),
            metrics: self.metrics.clone(),
            max_batch_size: self.max_batch_size,
            collector_id: self.collector_id.clone(),
        }
    }
}

impl<D: DeliveryClient> FlushContext<D> {
    fn next_batch(&self) -> Option<Batch> {
        let batch = self.buffer.drain(self.max_batch_size)?;
        Some(match &self.collector_id {
            Some(id) => batch.with_source(id.clone()),
            None => batch,
        })
    }

    fn dead_letter(&self, batch: Batch, reason: impl Into<String>) {
        give_up(&*self.dead_letters, &self.metrics, batch, reason);
    }

    /// Dead-letter every reading still pending.
    fn dead_letter_remaining(&self, reason: &str) {
        while let Some(batch) = self.next_batch() {
            self.dead_letter(batch, reason);
        }
    }
}

/// Orchestrates sources, buffer and delivery client.
///
/// `start` must be called from within a tokio runtime. Call `stop` to
/// deliver what is still buffered; dropping a running scheduler
/// dead-letters it instead.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use greenhouse_collector::buffer::SampleBuffer;
/// use greenhouse_collector::config::Config;
/// use greenhouse_collector::dead_letter::MemoryDeadLetterSink;
/// use greenhouse_collector::delivery::HttpDeliveryClient;
/// use greenhouse_collector::scheduler::{CollectionScheduler, SchedulerConfig};
/// use greenhouse_collector::source::default_rig;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = HttpDeliveryClient::new(&config).expect("Failed to create client");
///     let mut scheduler = CollectionScheduler::new(
///         SchedulerConfig::from_config(&config),
///         default_rig(),
///         Arc::new(SampleBuffer::new(config.buffer_capacity)),
///         Arc::new(client),
///         Arc::new(MemoryDeadLetterSink::new()),
///     );
///
///     scheduler
///         .start(config.sampling_interval, config.flush_interval)
///         .expect("Failed to start");
///     tokio::time::sleep(Duration::from_secs(60)).await;
///     scheduler.stop().await;
/// }
/// ```
pub struct CollectionScheduler<D: DeliveryClient> {
    config: SchedulerConfig,
    sources: Option<Vec<Box<dyn SensorSource>>>,
    context: FlushContext<D>,
    state: SchedulerState,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,

    /// Batch the final flush is sending, held here so an abandoned `stop`
    /// cannot lose it
    in_flight: Option<Batch>,
}

impl<D: DeliveryClient> CollectionScheduler<D> {
    pub fn new(
        config: SchedulerConfig,
        sources: Vec<Box<dyn SensorSource>>,
        buffer: Arc<SampleBuffer>,
        client: Arc<D>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let context = FlushContext {
            buffer,
            client,
            dead_letters,
            metrics: Arc::new(CollectorMetrics::new()),
            max_batch_size: config.max_batch_size.max(1),
            collector_id: config.collector_id.clone(),
        };

        Self {
            config,
            sources: Some(sources),
            context,
            state: SchedulerState::Idle,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            in_flight: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.context.buffer
    }

    /// Current counters, including buffer overflow and pending readings.
    pub fn metrics(&self) -> MetricsSnapshot {
        let buffer = &self.context.buffer;
        self.context
            .metrics
            .snapshot(buffer.overflow_count(), buffer.len())
    }

    /// Start the sampling and flush tasks.
    pub fn start(
        &mut self,
        sampling_interval: Duration,
        flush_interval: Duration,
    ) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::InvalidState(self.state));
        }
        if sampling_interval.is_zero() {
            return Err(SchedulerError::ZeroInterval("sampling"));
        }
        if flush_interval.is_zero() {
            return Err(SchedulerError::ZeroInterval("flush"));
        }

        let sources = self.sources.take().unwrap_or_default();
        info!(
            sources = sources.len(),
            sampling_interval_ms = sampling_interval.as_millis() as u64,
            flush_interval_ms = flush_interval.as_millis() as u64,
            max_batch_size = self.context.max_batch_size,
            "Starting collection scheduler"
        );

        let sampling = tokio::spawn(sampling_loop(
            sources,
            self.context.buffer.clone(),
            self.context.metrics.clone(),
            sampling_interval,
            self.cancel.clone(),
        ));
        let flush = tokio::spawn(flush_loop(
            self.context.clone(),
            self.config.retry.clone(),
            flush_interval,
            self.cancel.clone(),
        ));

        self.tasks = vec![("sampling", sampling), ("flush", flush)];
        self.state = SchedulerState::Running;
        Ok(())
    }

    /// Stop the scheduler and return its final state.
    ///
    /// Cancels both tasks, then drains and sends what is left within the
    /// shutdown timeout. Anything not acknowledged by then is dead-lettered.
    /// Calling `stop` after it completed is a no-op. If an earlier call was
    /// dropped before finishing, the next call completes the shutdown.
    pub async fn stop(&mut self) -> SchedulerState {
        match self.state {
            SchedulerState::Running => {
                self.state = SchedulerState::Stopping;
                info!(
                    shutdown_timeout_secs = self.config.shutdown_timeout.as_secs_f64(),
                    "Stopping collection scheduler"
                );
                self.cancel.cancel();
            }
            SchedulerState::Stopping => {
                warn!("Resuming an interrupted shutdown");
            }
            SchedulerState::Idle => {
                info!("Scheduler stopped before it was started");
                self.state = SchedulerState::Stopped;
                return self.state;
            }
            SchedulerState::Stopped => return self.state,
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;

        if let Some(batch) = self.in_flight.take() {
            self.context.dead_letter(batch, "shutdown interrupted");
        }

        // Handles leave the list only once resolved, so a dropped `stop`
        // leaves the rest for the next call
        while let Some((name, handle)) = self.tasks.first_mut() {
            let name = *name;
            match timeout_at(deadline, &mut *handle).await {
                Ok(Ok(())) => debug!(task = name, "Task finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed during shutdown"),
                Err(_) => {
                    warn!(task = name, "Task did not stop before shutdown timeout, aborting");
                    handle.abort();
                }
            }
            self.tasks.remove(0);
        }

        final_flush(&self.context, &mut self.in_flight, deadline).await;

        self.state = SchedulerState::Stopped;
        let metrics = self.metrics();
        info!(
            batches_acked = metrics.batches_acked,
            batches_dead_lettered = metrics.batches_dead_lettered,
            overflow_count = metrics.overflow_count,
            read_errors = metrics.read_errors,
            "Collection scheduler stopped"
        );
        self.state
    }
}

impl<D: DeliveryClient> Drop for CollectionScheduler<D> {
    fn drop(&mut self) {
        // Tasks must not outlive the scheduler that owns them
        self.cancel.cancel();

        if matches!(self.state, SchedulerState::Running | SchedulerState::Stopping) {
            let reason = "scheduler dropped before stop completed";
            let in_flight = self.in_flight.as_ref().map_or(0, Batch::len);
            warn!(
                state = %self.state,
                pending = self.context.buffer.len() + in_flight,
                "Scheduler dropped without a completed stop, dead-lettering pending readings"
            );
            if let Some(batch) = self.in_flight.take() {
                self.context.dead_letter(batch, reason);
            }
            self.context.dead_letter_remaining(reason);
        }
    }
}

/// Sample every source once per tick until cancelled.
async fn sampling_loop(
    mut sources: Vec<Box<dyn SensorSource>>,
    buffer: Arc<SampleBuffer>,
    metrics: Arc<CollectorMetrics>,
    sampling_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(sampling_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sampled_since_report: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for source in sources.iter_mut() {
            match source.sample() {
                Ok(reading) => {
                    metrics.record_sample();
                    sampled_since_report += 1;

                    if let Some(channel) = GreenhouseChannel::from_sensor_id(&reading.sensor_id) {
                        if channel.classify(reading.value) == ChannelStatus::Critical {
                            warn!(
                                sensor_id = %reading.sensor_id,
                                value = reading.value,
                                unit = %reading.unit,
                                "Reading outside critical threshold"
                            );
                        }
                    }

                    buffer.push(reading);
                }
                Err(e) => {
                    metrics.record_read_error();
                    warn!(sensor_id = source.sensor_id(), error = %e, "Sensor read failed, skipping");
                }
            }
        }

        if last_report.elapsed() >= PROGRESS_REPORT_INTERVAL {
            info!(
                readings = sampled_since_report,
                pending = buffer.len(),
                overflow_count = buffer.overflow_count(),
                "Sampling progress"
            );
            sampled_since_report = 0;
            last_report = Instant::now();
        }
    }

    debug!("Sampling task stopped");
}

/// Drain and deliver on every tick until cancelled.
async fn flush_loop<D: DeliveryClient>(
    context: FlushContext<D>,
    policy: RetryPolicy,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    // First flush one interval after start so the first batch has readings
    let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        while let Some(batch) = context.next_batch() {
            let outcome = deliver_with_retry(
                &*context.client,
                batch,
                &policy,
                &cancel,
                &*context.dead_letters,
                &context.metrics,
            )
            .await;

            if outcome == DeliveryOutcome::Cancelled {
                debug!("Flush task cancelled mid-delivery");
                return;
            }
        }
    }

    debug!("Flush task stopped");
}

/// One attempt per remaining batch, all within `deadline`.
///
/// The batch being sent lives in `in_flight` until its outcome is recorded.
async fn final_flush<D: DeliveryClient>(
    context: &FlushContext<D>,
    in_flight: &mut Option<Batch>,
    deadline: Instant,
) {
    let mut flushed = 0usize;

    while let Some(mut batch) = context.next_batch() {
        batch.attempt += 1;
        let sending = in_flight.insert(batch);
        let result = timeout_at(deadline, context.client.send(sending)).await;
        let Some(batch) = in_flight.take() else {
            break;
        };

        match result {
            Ok(DeliveryResult::Acked) => {
                context.metrics.record_ack(batch.len());
                flushed += batch.len();
            }
            Ok(DeliveryResult::Rejected(reason)) => {
                context.metrics.record_rejected();
                context.dead_letter(batch, format!("rejected: {}", reason));
            }
            Ok(DeliveryResult::TransportFailure(reason)) => {
                context.metrics.record_transport_failure();
                let reason = format!("final flush failed: {}", reason);
                context.dead_letter(batch, reason.as_str());
                context.dead_letter_remaining(&reason);
                break;
            }
            Err(_) => {
                warn!("Final flush hit shutdown timeout");
                context.dead_letter(batch, "shutdown timeout");
                context.dead_letter_remaining("shutdown timeout");
                break;
            }
        }
    }

    info!(readings = flushed, "Final flush complete");
}
