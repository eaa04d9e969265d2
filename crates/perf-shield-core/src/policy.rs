//! Emergency policy: when to capture, and what to do afterwards.
//!
//! Both halves are pluggable through [`EmergencyPolicy`], injected when the
//! shield is built. Callers can bring their own alerting without touching the
//! capture mechanics.

use tracing::{error, warn};

use crate::capture::CaptureReport;
use crate::config::DEFAULT_CPU_THRESHOLD;
use crate::sampler::UsageReading;

/// Trigger predicate plus post-capture action.
pub trait EmergencyPolicy: Send + Sync {
    /// Decide whether the latest readings warrant a capture.
    ///
    /// `history` already includes `current` as its newest entry (unless the
    /// history capacity is zero).
    fn should_trigger(
        &self,
        previous: UsageReading,
        current: UsageReading,
        history: &[UsageReading],
    ) -> bool;

    /// Called exactly once per capture sequence, after every stage resolved.
    ///
    /// The report carries the history as of trigger evaluation and the outcome
    /// of each stage, failures included.
    fn on_captured(&self, report: &CaptureReport);
}

/// Default policy: two consecutive readings strictly above a threshold.
///
/// Requiring two samples debounces single-tick spikes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    threshold: f64,
}

impl ThresholdPolicy {
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CPU_THRESHOLD)
    }
}

impl EmergencyPolicy for ThresholdPolicy {
    fn should_trigger(
        &self,
        previous: UsageReading,
        current: UsageReading,
        _history: &[UsageReading],
    ) -> bool {
        previous.cpu > self.threshold && current.cpu > self.threshold
    }

    fn on_captured(&self, report: &CaptureReport) {
        for err in report.errors() {
            error!(capture_id = %report.id, error = %err, "Capture stage failed");
        }
        warn!(
            capture_id = %report.id,
            history_len = report.history.len(),
            peak_cpu = report.peak_cpu(),
            "Emergency action done"
        );
    }
}

/// Policy assembled from two closures.
///
/// ```
/// use perf_shield_core::policy::{EmergencyPolicy, FnPolicy};
/// use perf_shield_core::sampler::UsageReading;
///
/// let policy = FnPolicy::new(
///     |_prev, cur: UsageReading, _history| cur.cpu > 90.0,
///     |report| eprintln!("captured {}", report.id),
/// );
/// assert!(policy.should_trigger(0.0.into(), 95.0.into(), &[]));
/// ```
pub struct FnPolicy<C, A> {
    condition: C,
    action: A,
}

impl<C, A> FnPolicy<C, A>
where
    C: Fn(UsageReading, UsageReading, &[UsageReading]) -> bool + Send + Sync,
    A: Fn(&CaptureReport) + Send + Sync,
{
    pub const fn new(condition: C, action: A) -> Self {
        Self { condition, action }
    }
}

impl<C, A> EmergencyPolicy for FnPolicy<C, A>
where
    C: Fn(UsageReading, UsageReading, &[UsageReading]) -> bool + Send + Sync,
    A: Fn(&CaptureReport) + Send + Sync,
{
    fn should_trigger(
        &self,
        previous: UsageReading,
        current: UsageReading,
        history: &[UsageReading],
    ) -> bool {
        (self.condition)(previous, current, history)
    }

    fn on_captured(&self, report: &CaptureReport) {
        (self.action)(report);
    }
}

impl<C, A> std::fmt::Debug for FnPolicy<C, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnPolicy").finish_non_exhaustive()
    }
}
