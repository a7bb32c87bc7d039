//! Bounded buffer holding readings until they are batched for delivery.
//!
//! The sampler pushes into the buffer and the flush path drains it. Both
//! go through a single mutex so no two drains ever see the same reading.
//! When the buffer is full the oldest reading is evicted and counted;
//! `push` never blocks the sampler and never fails.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::reading::{Batch, Reading};

/// Default number of readings held before the oldest is evicted.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1_000;

/// Overflow warnings are logged for the first eviction and then every Nth.
const OVERFLOW_LOG_EVERY: u64 = 100;

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of readings pushed
    pub readings_received: u64,

    /// Total number of readings handed out in batches
    pub readings_drained: u64,

    /// Number of readings evicted because the buffer was full
    pub overflow_count: u64,

    /// Number of batches created
    pub batches_created: u64,
}

#[derive(Debug)]
struct BufferState {
    pending: VecDeque<Reading>,
    stats: BufferStats,
}

/// Capacity-bounded FIFO of readings awaiting delivery.
#[derive(Debug)]
pub struct SampleBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

impl SampleBuffer {
    /// Create a buffer holding at most `capacity` readings (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                pending: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
                stats: BufferStats::default(),
            }),
        }
    }

    /// Create a buffer with the default capacity.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // State is a queue plus counters, always consistent between calls
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a reading, evicting the oldest one if the buffer is full.
    pub fn push(&self, reading: Reading) {
        let mut state = self.lock();
        state.stats.readings_received += 1;

        if state.pending.len() >= self.capacity {
            if let Some(evicted) = state.pending.pop_front() {
                state.stats.overflow_count += 1;
                let overflow_count = state.stats.overflow_count;
                if overflow_count == 1 || overflow_count % OVERFLOW_LOG_EVERY == 0 {
                    warn!(
                        capacity = self.capacity,
                        overflow_count,
                        evicted_sensor = %evicted.sensor_id,
                        "Buffer overflow: dropping oldest reading"
                    );
                }
            }
        }

        state.pending.push_back(reading);
    }

    /// Remove up to `max_batch_size` of the oldest readings as a new batch.
    ///
    /// Returns `None` when nothing is pending.
    pub fn drain(&self, max_batch_size: usize) -> Option<Batch> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return None;
        }

        let take = max_batch_size.max(1).min(state.pending.len());
        let readings: Vec<Reading> = state.pending.drain(..take).collect();
        state.stats.readings_drained += readings.len() as u64;
        state.stats.batches_created += 1;
        let remaining = state.pending.len();
        drop(state);

        let batch = Batch::new(readings);
        debug!(
            batch_id = %batch.batch_id,
            batch_size = batch.len(),
            remaining,
            "Drained batch from buffer"
        );
        Some(batch)
    }

    /// Get the number of pending readings.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Check if no readings are pending.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Get the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of readings evicted so far.
    pub fn overflow_count(&self) -> u64 {
        self.lock().stats.overflow_count
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> BufferStats {
        self.lock().stats.clone()
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn reading(sensor_id: &str, value: f64) -> Reading {
        Reading::new(sensor_id, value, "°C")
    }

    fn values(batch: &Batch) -> Vec<f64> {
        batch.readings.iter().map(|r| r.value).collect()
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let buffer = SampleBuffer::new(3);
        // A=0, B=1, C=2, D=3
        for value in [0.0, 1.0, 2.0, 3.0] {
            buffer.push(reading("temperature", value));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.overflow_count(), 1);

        let batch = buffer.drain(10).expect("Should get batch");
        assert_eq!(values(&batch), vec![1.0, 2.0, 3.0]);
        assert_eq!(batch.attempt, 0);

        assert!(buffer.drain(10).is_none());
    }

    #[test]
    fn test_overflow_count_matches_excess() {
        let capacity = 50;
        let total = 237;
        let buffer = SampleBuffer::new(capacity);
        for i in 0..total {
            buffer.push(reading("humidity", i as f64));
        }

        assert_eq!(buffer.len(), capacity);
        assert_eq!(buffer.overflow_count(), (total - capacity) as u64);
        assert_eq!(buffer.stats().readings_received, total as u64);
    }

    #[test]
    fn test_second_drain_is_empty() {
        let buffer = SampleBuffer::new(10);
        buffer.push(reading("light", 1.0));
        buffer.push(reading("light", 2.0));

        assert_eq!(buffer.drain(10).map(|b| b.len()), Some(2));
        assert!(buffer.drain(10).is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_respects_max_batch_size() {
        let buffer = SampleBuffer::new(100);
        for i in 0..25 {
            buffer.push(reading("co2", i as f64));
        }

        let first = buffer.drain(10).unwrap();
        let second = buffer.drain(10).unwrap();
        let third = buffer.drain(10).unwrap();

        assert_eq!(values(&first), (0..10).map(|v| v as f64).collect::<Vec<_>>());
        assert_eq!(values(&second), (10..20).map(|v| v as f64).collect::<Vec<_>>());
        assert_eq!(third.len(), 5);
        assert_ne!(first.batch_id, second.batch_id);
        assert_eq!(buffer.stats().batches_created, 3);
    }

    #[test]
    fn test_drain_preserves_per_sensor_order() {
        let buffer = SampleBuffer::new(100);
        for i in 0..20 {
            let sensor = if i % 2 == 0 { "temperature" } else { "humidity" };
            buffer.push(reading(sensor, i as f64));
        }

        let batch = buffer.drain(100).unwrap();
        for sensor in ["temperature", "humidity"] {
            let seen: Vec<f64> = batch
                .readings
                .iter()
                .filter(|r| r.sensor_id == sensor)
                .map(|r| r.value)
                .collect();
            let mut sorted = seen.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(seen, sorted);
        }
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = SampleBuffer::new(0);
        buffer.push(reading("soil_moisture", 1.0));
        buffer.push(reading("soil_moisture", 2.0));
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.overflow_count(), 1);
    }

    #[test]
    fn test_concurrent_push_and_drain_never_overlap() {
        let buffer = Arc::new(SampleBuffer::new(10_000));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        buffer.push(reading(&format!("sensor-{}", p), i as f64));
                    }
                })
            })
            .collect();

        let drainers: Vec<_> = (0..2)
            .map(|_| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..2_000 {
                        if let Some(batch) = buffer.drain(7) {
                            seen.extend(batch.readings);
                        }
                    }
                    seen
                })
            })
            .collect();

        for handle in producers {
            handle.join().unwrap();
        }
        let mut collected: Vec<Reading> = Vec::new();
        for handle in drainers {
            collected.extend(handle.join().unwrap());
        }
        while let Some(batch) = buffer.drain(100) {
            collected.extend(batch.readings);
        }

        assert_eq!(collected.len(), 2_000);
        let unique: HashSet<(String, u64)> = collected
            .iter()
            .map(|r| (r.sensor_id.clone(), r.value as u64))
            .collect();
        assert_eq!(unique.len(), 2_000);
    }
}
