//! Counters for sampling and delivery, queryable while the collector runs.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared by the scheduler tasks.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    samples_taken: AtomicU64,
    read_errors: AtomicU64,
    batches_acked: AtomicU64,
    readings_acked: AtomicU64,
    batches_rejected: AtomicU64,
    transport_failures: AtomicU64,
    retries: AtomicU64,
    batches_dead_lettered: AtomicU64,
    readings_dead_lettered: AtomicU64,
}

/// Point-in-time copy of the collector counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub samples_taken: u64,
    pub read_errors: u64,
    pub overflow_count: u64,
    pub pending: usize,
    pub batches_acked: u64,
    pub readings_acked: u64,
    pub batches_rejected: u64,
    pub transport_failures: u64,
    pub retries: u64,
    pub batches_dead_lettered: u64,
    pub readings_dead_lettered: u64,
}

impl CollectorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sample(&self) {
        self.samples_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self, readings: usize) {
        self.batches_acked.fetch_add(1, Ordering::Relaxed);
        self.readings_acked
            .fetch_add(readings as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self, readings: usize) {
        self.batches_dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.readings_dead_lettered
            .fetch_add(readings as u64, Ordering::Relaxed);
    }

    /// Copy the counters; buffer figures are supplied by the caller.
    pub fn snapshot(&self, overflow_count: u64, pending: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_taken: self.samples_taken.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            overflow_count,
            pending,
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            readings_acked: self.readings_acked.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_dead_lettered: self.batches_dead_lettered.load(Ordering::Relaxed),
            readings_dead_lettered: self.readings_dead_lettered.load(Ordering::Relaxed),
        }
    }
}
