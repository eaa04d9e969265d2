//! The control loop: sample, record, evaluate, capture.
//!
//! Every `flush_time` seconds a tick:
//!
//! 1. asks the [`UsageSampler`] for the monitored pid's CPU usage (a failed
//!    lookup is logged and the tick is skipped);
//! 2. shifts previous/current and records the reading in the history;
//! 3. evaluates the [`EmergencyPolicy`] against (previous, current, history);
//! 4. on a trigger, hands off to the [`CaptureOrchestrator`], which drops the
//!    trigger if a capture is already in flight.
//!
//! Ticks never wait for a capture. Sampling continues during the profile
//! window so the history stays fresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactWriter, FsArtifactWriter};
use crate::capture::{CaptureOrchestrator, CaptureReport, CaptureSettings, CaptureTrigger};
use crate::config::{ShieldConfig, ShieldOverrides};
use crate::diagnostics::{
    ProcSnapshotService, ProfileService, SnapshotService, ThreadProfileService,
};
use crate::error::{Error, Result};
use crate::history::HistoryBuffer;
use crate::policy::{EmergencyPolicy, ThresholdPolicy};
use crate::sampler::{ProcUsageSampler, UsageReading, UsageSampler};

// =============================================================================
// Collaborators
// =============================================================================

/// External services the shield talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub sampler: Arc<dyn UsageSampler>,
    pub snapshots: Arc<dyn SnapshotService>,
    pub profiler: Arc<dyn ProfileService>,
    pub writer: Arc<dyn ArtifactWriter>,
}

impl Collaborators {
    /// Built-in `/proc` backed services for `pid`, writing to the filesystem.
    #[must_use]
    pub fn for_process(pid: u32) -> Self {
        Self {
            sampler: Arc::new(ProcUsageSampler::new()),
            snapshots: Arc::new(ProcSnapshotService::new(pid)),
            profiler: Arc::new(ThreadProfileService::new(pid)),
            writer: Arc::new(FsArtifactWriter),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
struct ShieldCounters {
    ticks: AtomicU64,
    sampler_failures: AtomicU64,
    triggers_accepted: AtomicU64,
    triggers_dropped: AtomicU64,
}

impl ShieldCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time counters of a running shield.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldStats {
    pub ticks: u64,
    pub sampler_failures: u64,
    pub triggers_accepted: u64,
    /// Triggers that arrived while a capture was in flight.
    pub triggers_dropped: u64,
    pub captures_completed: u64,
    pub capturing: bool,
}

fn collect_stats(counters: &ShieldCounters, orchestrator: &CaptureOrchestrator) -> ShieldStats {
    ShieldStats {
        ticks: counters.ticks.load(Ordering::Relaxed),
        sampler_failures: counters.sampler_failures.load(Ordering::Relaxed),
        triggers_accepted: counters.triggers_accepted.load(Ordering::Relaxed),
        triggers_dropped: counters.triggers_dropped.load(Ordering::Relaxed),
        captures_completed: orchestrator.completed_sequences(),
        capturing: orchestrator.is_capturing(),
    }
}

// =============================================================================
// Shield
// =============================================================================

/// What a single tick did.
#[derive(Debug)]
pub enum TickOutcome {
    /// Lookup failed; history and previous reading untouched.
    SamplerFailed,
    /// Reading recorded, policy did not fire.
    Recorded(UsageReading),
    /// Policy fired and a capture sequence was spawned.
    CaptureStarted(JoinHandle<CaptureReport>),
    /// Policy fired while a capture was in flight.
    CaptureSkipped,
}

/// The CPU watchdog.
pub struct Shield {
    config: ShieldConfig,
    pid: u32,
    sampler: Arc<dyn UsageSampler>,
    policy: Arc<dyn EmergencyPolicy>,
    orchestrator: CaptureOrchestrator,
    history: HistoryBuffer,
    previous: UsageReading,
    counters: Arc<ShieldCounters>,
}

impl Shield {
    /// Build a shield from a config, collaborators and policy.
    pub fn new(
        config: ShieldConfig,
        collaborators: Collaborators,
        policy: Arc<dyn EmergencyPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            sampler,
            snapshots,
            profiler,
            writer,
        } = collaborators;
        let orchestrator = CaptureOrchestrator::new(
            CaptureSettings::from_config(&config),
            snapshots,
            profiler,
            writer,
            Arc::clone(&policy),
        );
        Ok(Self {
            pid: config.monitored_pid(),
            history: HistoryBuffer::new(config.cache_max_limit),
            config,
            sampler,
            policy,
            orchestrator,
            previous: UsageReading::default(),
            counters: Arc::new(ShieldCounters::default()),
        })
    }

    #[must_use]
    pub fn builder() -> ShieldBuilder {
        ShieldBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &ShieldConfig {
        &self.config
    }

    /// Monitored process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// Reading the next tick will treat as "previous".
    #[must_use]
    pub fn previous(&self) -> UsageReading {
        self.previous
    }

    #[must_use]
    pub fn orchestrator(&self) -> &CaptureOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn stats(&self) -> ShieldStats {
        collect_stats(&self.counters, &self.orchestrator)
    }

    /// Run one iteration of the control loop.
    pub async fn tick(&mut self) -> TickOutcome {
        ShieldCounters::bump(&self.counters.ticks);

        let current = match self
            .sampler
            .lookup(self.pid, &self.config.cpu_usage_options)
            .await
        {
            Ok(reading) => reading,
            Err(err) => {
                ShieldCounters::bump(&self.counters.sampler_failures);
                warn!(pid = self.pid, error = %err, "CPU usage lookup failed, skipping tick");
                return TickOutcome::SamplerFailed;
            }
        };

        let previous = std::mem::replace(&mut self.previous, current);
        debug!(
            pid = self.pid,
            cpu = current.cpu,
            previous = previous.cpu,
            "CPU usage lookup executed"
        );

        if let Some(evicted) = self.history.record(current) {
            debug!(
                limit = self.history.capacity(),
                evicted = evicted.cpu,
                "History limit reached"
            );
        }

        let history = self.history.snapshot();
        if !self.policy.should_trigger(previous, current, &history) {
            return TickOutcome::Recorded(current);
        }
        debug!(previous = previous.cpu, cpu = current.cpu, "Emergency condition true");

        let trigger = CaptureTrigger {
            previous,
            current,
            history,
        };
        if let Some(handle) = self.orchestrator.spawn(trigger) {
            ShieldCounters::bump(&self.counters.triggers_accepted);
            TickOutcome::CaptureStarted(handle)
        } else {
            ShieldCounters::bump(&self.counters.triggers_dropped);
            debug!(cpu = current.cpu, "Capture already in flight, trigger dropped");
            TickOutcome::CaptureSkipped
        }
    }

    /// Tick every `flush_time` until `shutdown` is set.
    ///
    /// The first tick fires one period after the call. Late ticks are skipped
    /// rather than bursted.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        let period = self.config.flush_interval();
        let Some(first) = first_tick_at(Instant::now(), period) else {
            error!(
                pid = self.pid,
                flush_secs = self.config.flush_time,
                "Flush interval overflows the clock, shield not started"
            );
            return;
        };
        let mut interval = tokio::time::interval_at(first, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            pid = self.pid,
            flush_secs = self.config.flush_time,
            sampling_secs = self.config.sampling_time,
            history_limit = self.config.cache_max_limit,
            logs_path = %self.config.logs_path.display(),
            "Shield started"
        );

        loop {
            interval.tick().await;

            if shutdown.load(Ordering::SeqCst) {
                info!(pid = self.pid, "Shield: shutdown signal received");
                break;
            }

            // Capture tasks run detached; the handle is not needed here
            let _ = self.tick().await;
        }
    }

    /// Spawn the control loop on the current Tokio runtime.
    pub fn spawn(self) -> ShieldHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::clone(&self.counters);
        let orchestrator = self.orchestrator.clone();
        let task = tokio::spawn(self.run(Arc::clone(&shutdown)));
        ShieldHandle {
            task,
            shutdown,
            counters,
            orchestrator,
        }
    }
}

impl std::fmt::Debug for Shield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shield")
            .field("pid", &self.pid)
            .field("config", &self.config)
            .field("history_len", &self.history.len())
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Shield`], filling anything unset with the built-ins.
#[derive(Default)]
pub struct ShieldBuilder {
    config: Option<ShieldConfig>,
    sampler: Option<Arc<dyn UsageSampler>>,
    snapshots: Option<Arc<dyn SnapshotService>>,
    profiler: Option<Arc<dyn ProfileService>>,
    writer: Option<Arc<dyn ArtifactWriter>>,
    policy: Option<Arc<dyn EmergencyPolicy>>,
}

impl ShieldBuilder {
    #[must_use]
    pub fn config(mut self, config: ShieldConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn UsageSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    #[must_use]
    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotService>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    #[must_use]
    pub fn profiler(mut self, profiler: Arc<dyn ProfileService>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    #[must_use]
    pub fn writer(mut self, writer: Arc<dyn ArtifactWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn EmergencyPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validate the config and build.
    pub fn build(self) -> Result<Shield> {
        let config = self.config.unwrap_or_default();
        let pid = config.monitored_pid();
        let collaborators = Collaborators {
            sampler: self
                .sampler
                .unwrap_or_else(|| Arc::new(ProcUsageSampler::new())),
            snapshots: self
                .snapshots
                .unwrap_or_else(|| Arc::new(ProcSnapshotService::new(pid))),
            profiler: self
                .profiler
                .unwrap_or_else(|| Arc::new(ThreadProfileService::new(pid))),
            writer: self.writer.unwrap_or_else(|| Arc::new(FsArtifactWriter)),
        };
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(ThresholdPolicy::new(config.cpu_threshold)));
        Shield::new(config, collaborators, policy)
    }
}

impl std::fmt::Debug for ShieldBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShieldBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Control handle for a spawned shield.
pub struct ShieldHandle {
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<ShieldCounters>,
    orchestrator: CaptureOrchestrator,
}

impl ShieldHandle {
    /// Ask the loop to stop at its next tick.
    ///
    /// An in-flight capture sequence still runs to completion.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the control loop task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    #[must_use]
    pub fn stats(&self) -> ShieldStats {
        collect_stats(&self.counters, &self.orchestrator)
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.orchestrator.is_capturing()
    }
}

impl std::fmt::Debug for ShieldHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShieldHandle")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn first_tick_at(now: Instant, period: Duration) -> Option<Instant> {
    now.checked_add(period)
}

/// Start a shield with the built-in collaborators and threshold policy.
///
/// Overrides are merged shallowly over the defaults. Must be called from
/// within a Tokio runtime.
pub fn start(overrides: ShieldOverrides) -> Result<ShieldHandle> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(Error::Runtime(
            "perf-shield must be started from within a Tokio runtime".into(),
        ));
    }
    let config = ShieldConfig::from_overrides(overrides)?;
    Ok(Shield::builder().config(config).build()?.spawn())
}

// =============================================================================
// Tests
// =============================================================================
