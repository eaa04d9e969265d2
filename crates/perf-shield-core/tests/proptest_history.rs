//! Property-based tests for the history buffer.
//!
//! - length never exceeds capacity and equals min(recorded, capacity)
//! - contents are exactly the most recent `capacity` readings, oldest first
//! - each record into a full buffer evicts exactly the oldest reading
//! - recorded/evicted counters stay consistent

use proptest::prelude::*;

use perf_shield_core::history::HistoryBuffer;
use perf_shield_core::sampler::UsageReading;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_cpu() -> impl Strategy<Value = f64> {
    0.0f64..=800.0
}

fn arb_readings() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(arb_cpu(), 0..300)
}

fn cpus(history: &HistoryBuffer) -> Vec<f64> {
    history.iter().map(|r| r.cpu).collect()
}

// ────────────────────────────────────────────────────────────────────
// Bounds and ordering
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Length is min(recorded, capacity) after every record.
    #[test]
    fn prop_len_bounded_by_capacity(capacity in 0usize..64, readings in arb_readings()) {
        let mut history = HistoryBuffer::new(capacity);
        for (i, cpu) in readings.iter().enumerate() {
            history.record(UsageReading::new(*cpu));
            prop_assert!(history.len() <= capacity);
            prop_assert_eq!(history.len(), (i + 1).min(capacity));
        }
    }

    /// Contents equal the tail of the input, in arrival order.
    #[test]
    fn prop_keeps_most_recent_in_order(capacity in 1usize..64, readings in arb_readings()) {
        let mut history = HistoryBuffer::new(capacity);
        for cpu in &readings {
            history.record(UsageReading::new(*cpu));
        }
        let start = readings.len().saturating_sub(capacity);
        prop_assert_eq!(cpus(&history), readings[start..].to_vec());
        prop_assert_eq!(history.latest().map(|r| r.cpu), readings.last().copied());
    }

    /// A record into a full buffer evicts exactly the previous oldest reading.
    #[test]
    fn prop_full_buffer_evicts_oldest(capacity in 1usize..32, readings in arb_readings()) {
        let mut history = HistoryBuffer::new(capacity);
        for cpu in readings {
            let oldest = history.iter().next().copied();
            let was_full = history.is_full();
            let evicted = history.record(UsageReading::new(cpu));
            if was_full {
                prop_assert_eq!(evicted, oldest);
            } else {
                prop_assert!(evicted.is_none());
            }
        }
    }

    /// recorded = len + evicted at all times.
    #[test]
    fn prop_counters_consistent(capacity in 0usize..32, readings in arb_readings()) {
        let mut history = HistoryBuffer::new(capacity);
        for cpu in &readings {
            history.record(UsageReading::new(*cpu));
            prop_assert_eq!(
                history.total_recorded(),
                history.len() as u64 + history.total_evicted()
            );
        }
        prop_assert_eq!(history.total_recorded(), readings.len() as u64);
    }

    /// snapshot() is an owned copy that later records do not change.
    #[test]
    fn prop_snapshot_is_detached(capacity in 1usize..16, readings in arb_readings(), extra in arb_cpu()) {
        let mut history = HistoryBuffer::new(capacity);
        for cpu in &readings {
            history.record(UsageReading::new(*cpu));
        }
        let before = history.snapshot();
        history.record(UsageReading::new(extra));
        let start = readings.len().saturating_sub(capacity);
        let expected: Vec<UsageReading> =
            readings[start..].iter().copied().map(UsageReading::new).collect();
        prop_assert_eq!(before, expected);
    }
}
