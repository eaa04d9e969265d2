//! Bounded FIFO history of CPU readings.
//!
//! Keeps the most recent `capacity` readings in arrival order. Recording into
//! a full buffer evicts exactly one reading, the oldest, before appending.
//! A capacity of zero is legal and keeps the history permanently empty.

use std::collections::VecDeque;

use crate::sampler::UsageReading;

/// Rolling window of the most recent readings.
///
/// # Example
///
/// ```
/// use perf_shield_core::history::HistoryBuffer;
///
/// let mut history = HistoryBuffer::new(3);
/// for cpu in [10.0, 20.0, 60.0, 70.0] {
///     history.record(cpu.into());
/// }
/// let cpus: Vec<f64> = history.iter().map(|r| r.cpu).collect();
/// assert_eq!(cpus, vec![20.0, 60.0, 70.0]);
/// ```
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    readings: VecDeque<UsageReading>,
    capacity: usize,
    total: u64,
}

impl HistoryBuffer {
    /// Create an empty history holding at most `capacity` readings.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    /// Append a reading, evicting and returning the oldest one if full.
    pub fn record(&mut self, reading: UsageReading) -> Option<UsageReading> {
        self.total += 1;
        if self.capacity == 0 {
            return Some(reading);
        }
        let evicted = if self.readings.len() == self.capacity {
            self.readings.pop_front()
        } else {
            None
        };
        self.readings.push_back(reading);
        evicted
    }

    /// Ordered copy of the history, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UsageReading> {
        self.readings.iter().copied().collect()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &UsageReading> + '_ {
        self.readings.iter()
    }

    /// Most recently recorded reading still in the window.
    #[must_use]
    pub fn latest(&self) -> Option<UsageReading> {
        self.readings.back().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.readings.len() == self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total readings ever recorded, including evicted ones.
    #[must_use]
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    /// Total readings that were evicted.
    #[must_use]
    pub fn total_evicted(&self) -> u64 {
        self.total - self.readings.len() as u64
    }
}
