//! Retry policy for batch delivery.
//!
//! Transport failures are retried with exponential backoff and jitter until
//! the attempt budget runs out, at which point the batch is dead-lettered.
//! Rejections are never retried. Both the send and the backoff sleep race
//! against the shutdown token so a stopping collector never waits on them.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dead_letter::{self, DeadLetter, DeadLetterSink};
use crate::delivery::{DeliveryClient, DeliveryResult};
use crate::metrics::CollectorMetrics;
use crate::reading::Batch;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on any single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

const DEFAULT_FACTOR: f64 = 2.0;
const DEFAULT_JITTER: f64 = 0.2;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,

    /// Relative jitter; 0.2 spreads each delay over ±20%
    pub jitter: f64,

    /// Retries allowed after the first attempt
    pub max_retry_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            factor: DEFAULT_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Default backoff with the given retry budget.
    pub fn new(max_retry_attempts: u32) -> Self {
        Self {
            max_retry_attempts,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Total attempts a batch may get, counting the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retry_attempts.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// `min(base * factor^(retry-1), max)`, scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]` and capped at `max` again.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let max = self.max_delay.as_secs_f64();
        let nominal = (self.base_delay.as_secs_f64() * self.factor.powi(exponent)).min(max);

        let scale = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };

        Duration::from_secs_f64((nominal * scale).clamp(0.0, max))
    }
}

/// Final state of a batch handed to [`deliver_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rejected(String),
    DeadLettered(String),
    Cancelled,
}

/// Deliver a batch, retrying transport failures per `policy`.
///
/// Every path that does not end in an ack writes the batch to `sink`.
pub async fn deliver_with_retry<D: DeliveryClient>(
    client: &D,
    mut batch: Batch,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    sink: &dyn DeadLetterSink,
    metrics: &CollectorMetrics,
) -> DeliveryOutcome {
    loop {
        if cancel.is_cancelled() {
            give_up(sink, metrics, batch, "cancelled during shutdown");
            return DeliveryOutcome::Cancelled;
        }

        batch.attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = client.send(&batch) => Some(result),
        };
        let Some(result) = result else {
            give_up(sink, metrics, batch, "cancelled during shutdown");
            return DeliveryOutcome::Cancelled;
        };

        match result {
            DeliveryResult::Acked => {
                metrics.record_ack(batch.len());
                debug!(
                    batch_id = %batch.batch_id,
                    batch_size = batch.len(),
                    attempt = batch.attempt,
                    "Batch delivered"
                );
                return DeliveryOutcome::Acked;
            }
            DeliveryResult::Rejected(reason) => {
                metrics.record_rejected();
                error!(
                    batch_id = %batch.batch_id,
                    reason = %reason,
                    "Batch rejected by endpoint"
                );
                give_up(sink, metrics, batch, format!("rejected: {}", reason));
                return DeliveryOutcome::Rejected(reason);
            }
            DeliveryResult::TransportFailure(reason) => {
                metrics.record_transport_failure();

                if batch.attempt >= policy.max_attempts() {
                    let reason = format!(
                        "retries exhausted after {} attempts: {}",
                        batch.attempt, reason
                    );
                    give_up(sink, metrics, batch, reason.clone());
                    return DeliveryOutcome::DeadLettered(reason);
                }

                let delay = policy.delay_for(batch.attempt);
                metrics.record_retry();
                warn!(
                    batch_id = %batch.batch_id,
                    error = %reason,
                    attempt = batch.attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Delivery failed, will retry"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        give_up(sink, metrics, batch, "cancelled during shutdown");
                        return DeliveryOutcome::Cancelled;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Move a batch to the dead-letter sink.
pub(crate) fn give_up(
    sink: &dyn DeadLetterSink,
    metrics: &CollectorMetrics,
    batch: Batch,
    reason: impl Into<String>,
) {
    let letter = DeadLetter::new(batch, reason);
    error!(
        batch_id = %letter.batch.batch_id,
        batch_size = letter.batch.len(),
        final_attempt = letter.final_attempt,
        reason = %letter.reason,
        "Batch moved to dead-letter sink"
    );
    metrics.record_dead_letter(letter.batch.len());
    dead_letter::record(sink, &letter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::MemoryDeadLetterSink;
    use crate::reading::Reading;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails with a transport error `failures` times, then acks.
    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyClient {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DeliveryClient for FlakyClient {
        async fn send(&self, _batch: &Batch) -> DeliveryResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                DeliveryResult::TransportFailure("connection refused".to_string())
            } else {
                DeliveryResult::Acked
            }
        }
    }

    struct RejectingClient;

    impl DeliveryClient for RejectingClient {
        async fn send(&self, _batch: &Batch) -> DeliveryResult {
            DeliveryResult::Rejected("malformed batch".to_string())
        }
    }

    fn fast_policy(max_retry_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_retry_attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    fn test_batch() -> Batch {
        Batch::new(vec![Reading::new("temperature", 21.0, "°C")])
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_retry_attempts, 5);
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn test_backoff_delay_increases() {
        let policy = RetryPolicy::default();

        for (retry, nominal_ms) in [(1u32, 1_000u128), (2, 2_000), (3, 4_000), (4, 8_000)] {
            let delay = policy.delay_for(retry).as_millis();
            assert!(delay >= nominal_ms * 8 / 10, "retry {} too short: {}", retry, delay);
            assert!(delay <= nominal_ms * 12 / 10, "retry {} too long: {}", retry, delay);
        }
    }

    #[test]
    fn test_backoff_delay_caps_at_max() {
        let policy = RetryPolicy::default();
        for retry in [7, 10, 20, 100] {
            let delay = policy.delay_for(retry);
            assert!(delay <= Duration::from_secs(60));
            assert!(delay >= Duration::from_secs(48));
        }
    }

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(9), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_ack_after_transient_failures() {
        let client = FlakyClient::new(4);
        let sink = MemoryDeadLetterSink::new();
        let metrics = CollectorMetrics::new();

        let outcome = deliver_with_retry(
            &client,
            test_batch(),
            &fast_policy(5),
            &CancellationToken::new(),
            &sink,
            &metrics,
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(client.calls(), 5);
        assert!(sink.is_empty());

        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.batches_acked, 1);
        assert_eq!(snapshot.transport_failures, 4);
        assert_eq!(snapshot.retries, 4);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_once() {
        let client = FlakyClient::new(u32::MAX);
        let sink = MemoryDeadLetterSink::new();
        let metrics = CollectorMetrics::new();
        let batch = test_batch();
        let batch_id = batch.batch_id.clone();

        let outcome = deliver_with_retry(
            &client,
            batch,
            &fast_policy(5),
            &CancellationToken::new(),
            &sink,
            &metrics,
        )
        .await;

        assert!(matches!(outcome, DeliveryOutcome::DeadLettered(_)));
        assert_eq!(client.calls(), 6);

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].batch.batch_id, batch_id);
        assert_eq!(letters[0].final_attempt, 6);
        assert!(letters[0].reason.contains("retries exhausted"));
        assert_eq!(metrics.snapshot(0, 0).batches_dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let sink = MemoryDeadLetterSink::new();
        let metrics = CollectorMetrics::new();

        let outcome = deliver_with_retry(
            &RejectingClient,
            test_batch(),
            &fast_policy(5),
            &CancellationToken::new(),
            &sink,
            &metrics,
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Rejected("malformed batch".to_string()));
        assert_eq!(sink.letters()[0].final_attempt, 1);
        assert!(sink.letters()[0].reason.starts_with("rejected:"));
        assert_eq!(metrics.snapshot(0, 0).batches_rejected, 1);
        assert_eq!(metrics.snapshot(0, 0).retries, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let client = Arc::new(FlakyClient::new(u32::MAX));
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let metrics = Arc::new(CollectorMetrics::new());
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default().with_base_delay(Duration::from_secs(30));

        let task = {
            let (client, sink, metrics, cancel) =
                (client.clone(), sink.clone(), metrics.clone(), cancel.clone());
            tokio::spawn(async move {
                deliver_with_retry(&*client, test_batch(), &policy, &cancel, &*sink, &metrics).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("Should stop promptly")
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Cancelled);
        assert_eq!(client.calls(), 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.letters()[0].reason, "cancelled during shutdown");
    }
}
