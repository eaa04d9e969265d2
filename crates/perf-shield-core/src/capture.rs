//! Capture orchestration: snapshot + timed profile, never overlapping.
//!
//! State machine:
//!
//! ```text
//!            try_begin() ok                       guard dropped
//!   Idle ───────────────────────► Capturing ───────────────────────► Idle
//!     ▲                                │
//!     └──── try_begin() while busy ────┘  (returns None, trigger dropped)
//! ```
//!
//! A capture sequence runs two stages concurrently under one [`ArtifactId`]:
//!
//! 1. **Snapshot**: take, export, persist. Bounded by the snapshot timeout.
//! 2. **Profile**: start, record for exactly `sampling_time` from the start of
//!    recording, stop, export, persist.
//!
//! When both stages have resolved, the policy's `on_captured` runs with a
//! [`CaptureReport`] carrying every stage's outcome, then the guard drops and
//! the state returns to `Idle`. No failure path can skip either step.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactId, ArtifactKind, ArtifactWriter, epoch_ms};
use crate::config::ShieldConfig;
use crate::diagnostics::{ProfileService, SnapshotService};
use crate::error::CaptureError;
use crate::policy::EmergencyPolicy;
use crate::sampler::UsageReading;

// =============================================================================
// State
// =============================================================================

/// Whether a capture sequence is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Capturing,
}

impl CaptureState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Capturing => 1,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Capturing,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Capturing => write!(f, "capturing"),
        }
    }
}

/// Proof that the caller moved the orchestrator to `Capturing`.
///
/// Dropping it returns the state to `Idle`, including on unwind.
#[must_use = "dropping the guard immediately ends the capture"]
#[derive(Debug)]
pub struct CaptureGuard {
    state: Arc<AtomicU8>,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.state
            .store(CaptureState::Idle.as_u8(), Ordering::Release);
        debug!("Capture guard released");
    }
}

// =============================================================================
// Trigger and report
// =============================================================================

/// Readings that caused a capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureTrigger {
    pub previous: UsageReading,
    pub current: UsageReading,
    /// History as of trigger evaluation.
    pub history: Vec<UsageReading>,
}

/// Outcome of one capture sequence.
#[derive(Debug)]
pub struct CaptureReport {
    /// Identifier shared by both artifacts.
    pub id: ArtifactId,
    pub previous: UsageReading,
    pub current: UsageReading,
    /// History as of trigger evaluation; later readings are not included.
    pub history: Vec<UsageReading>,
    /// Path of the persisted snapshot, or why the stage failed.
    pub snapshot: Result<PathBuf, CaptureError>,
    /// Path of the persisted profile, or why the stage failed.
    pub profile: Result<PathBuf, CaptureError>,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl CaptureReport {
    /// Both artifacts were persisted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.snapshot.is_ok() && self.profile.is_ok()
    }

    /// Stage failures, snapshot first.
    pub fn errors(&self) -> impl Iterator<Item = &CaptureError> {
        self.snapshot
            .as_ref()
            .err()
            .into_iter()
            .chain(self.profile.as_ref().err())
    }

    /// Paths of the artifacts that were persisted.
    #[must_use]
    pub fn artifacts(&self) -> Vec<&Path> {
        [&self.snapshot, &self.profile]
            .into_iter()
            .filter_map(|r| r.as_ref().ok().map(PathBuf::as_path))
            .collect()
    }

    /// Highest reading in the trigger history.
    #[must_use]
    pub fn peak_cpu(&self) -> f64 {
        self.history
            .iter()
            .map(|r| r.cpu)
            .fold(self.current.cpu, f64::max)
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self {
            id: ArtifactId::new("test"),
            previous: UsageReading::default(),
            current: UsageReading::default(),
            history: Vec::new(),
            snapshot: Ok(PathBuf::from("test.snapshot")),
            profile: Ok(PathBuf::from("test.cpuprofile")),
            started_at_ms: 0,
            finished_at_ms: 0,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Timing and placement settings for capture sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub logs_path: PathBuf,
    pub sampling_time: Duration,
    pub snapshot_timeout: Duration,
}

impl CaptureSettings {
    #[must_use]
    pub fn from_config(config: &ShieldConfig) -> Self {
        Self {
            logs_path: config.logs_path.clone(),
            sampling_time: config.sampling_duration(),
            snapshot_timeout: config.snapshot_deadline(),
        }
    }
}

/// Runs capture sequences one at a time.
///
/// Cheap to clone; clones share the same state and collaborators.
#[derive(Clone)]
pub struct CaptureOrchestrator {
    settings: Arc<CaptureSettings>,
    state: Arc<AtomicU8>,
    completed: Arc<AtomicU64>,
    snapshots: Arc<dyn SnapshotService>,
    profiler: Arc<dyn ProfileService>,
    writer: Arc<dyn ArtifactWriter>,
    policy: Arc<dyn EmergencyPolicy>,
}

impl CaptureOrchestrator {
    #[must_use]
    pub fn new(
        settings: CaptureSettings,
        snapshots: Arc<dyn SnapshotService>,
        profiler: Arc<dyn ProfileService>,
        writer: Arc<dyn ArtifactWriter>,
        policy: Arc<dyn EmergencyPolicy>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            state: Arc::new(AtomicU8::new(CaptureState::Idle.as_u8())),
            completed: Arc::new(AtomicU64::new(0)),
            snapshots,
            profiler,
            writer,
            policy,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    #[must_use]
    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    /// Number of capture sequences that ran to the end.
    #[must_use]
    pub fn completed_sequences(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Atomically move `Idle -> Capturing`; `None` if already capturing.
    pub fn try_begin(&self) -> Option<CaptureGuard> {
        self.state
            .compare_exchange(
                CaptureState::Idle.as_u8(),
                CaptureState::Capturing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| CaptureGuard {
                state: Arc::clone(&self.state),
            })
    }

    /// Begin a capture and run it on a new task.
    ///
    /// Returns `None` without side effects when a capture is in flight.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(&self, trigger: CaptureTrigger) -> Option<JoinHandle<CaptureReport>> {
        let guard = self.try_begin()?;
        let this = self.clone();
        Some(tokio::spawn(async move { this.run(guard, trigger).await }))
    }

    /// Run a full capture sequence while holding `guard`.
    pub async fn run(&self, guard: CaptureGuard, trigger: CaptureTrigger) -> CaptureReport {
        let id = ArtifactId::generate();
        let started_at_ms = epoch_ms();
        info!(
            capture_id = %id,
            previous = trigger.previous.cpu,
            current = trigger.current.cpu,
            sampling_secs = self.settings.sampling_time.as_secs(),
            "Capture sequence started"
        );

        let (snapshot, profile) = tokio::join!(self.snapshot_stage(&id), self.profile_stage(&id));
        log_stage(&id, ArtifactKind::Snapshot, &snapshot);
        log_stage(&id, ArtifactKind::Profile, &profile);

        let report = CaptureReport {
            id,
            previous: trigger.previous,
            current: trigger.current,
            history: trigger.history,
            snapshot,
            profile,
            started_at_ms,
            finished_at_ms: epoch_ms(),
        };

        debug!(capture_id = %report.id, "Emergency action enter");
        self.policy.on_captured(&report);
        self.completed.fetch_add(1, Ordering::AcqRel);
        drop(guard);
        report
    }

    async fn snapshot_stage(&self, id: &ArtifactId) -> Result<PathBuf, CaptureError> {
        let path = id.path_in(&self.settings.logs_path, ArtifactKind::Snapshot);
        let deadline = self.settings.snapshot_timeout;
        match tokio::time::timeout(deadline, self.persist_snapshot(&path)).await {
            Ok(Ok(())) => Ok(path),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(CaptureError::SnapshotTimeout(deadline)),
        }
    }

    async fn persist_snapshot(&self, path: &Path) -> Result<(), CaptureError> {
        debug!("Snapshot stage start");
        let handle = self
            .snapshots
            .take_snapshot()
            .await
            .map_err(CaptureError::Snapshot)?;
        let bytes = handle.export().await.map_err(CaptureError::Snapshot)?;
        drop(handle);
        debug!(bytes = bytes.len(), "Snapshot stage write");
        self.writer.write(path, bytes).await?;
        Ok(())
    }

    async fn profile_stage(&self, id: &ArtifactId) -> Result<PathBuf, CaptureError> {
        let path = id.path_in(&self.settings.logs_path, ArtifactKind::Profile);
        debug!("Profile stage start");
        self.profiler
            .start_profiling(id, true)
            .await
            .map_err(CaptureError::Profile)?;

        // Hard window, measured from the start of recording.
        tokio::time::sleep(self.settings.sampling_time).await;

        debug!("Profile stage stop");
        let handle = self
            .profiler
            .stop_profiling()
            .await
            .map_err(CaptureError::Profile)?;
        let bytes = handle.export().await.map_err(CaptureError::Profile)?;
        drop(handle);
        debug!(bytes = bytes.len(), "Profile stage write");
        self.writer.write(&path, bytes).await?;
        Ok(path)
    }
}

impl std::fmt::Debug for CaptureOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureOrchestrator")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("completed", &self.completed_sequences())
            .finish_non_exhaustive()
    }
}

fn log_stage(id: &ArtifactId, kind: ArtifactKind, outcome: &Result<PathBuf, CaptureError>) {
    match outcome {
        Ok(path) => info!(
            capture_id = %id,
            artifact = %kind,
            path = %path.display(),
            "Artifact saved"
        ),
        Err(err) => warn!(capture_id = %id, artifact = %kind, error = %err, "Artifact not saved"),
    }
}

// =============================================================================
// Tests
// =============================================================================
