//! In-memory collaborators for unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::time::Instant;

use crate::artifact::{ArtifactId, ArtifactWriter, WriteFuture};
use crate::capture::CaptureReport;
use crate::diagnostics::{
    ExportFuture, ExportHandle, HandleFuture, ProfileService, SnapshotService, StartFuture,
};
use crate::error::{ExportError, SamplerError, WriteError};
use crate::policy::{EmergencyPolicy, ThresholdPolicy};
use crate::sampler::{SamplerFuture, SamplerOptions, UsageReading, UsageSampler};

/// Export handle returning fixed bytes, or failing.
pub(crate) struct StaticExport {
    bytes: Vec<u8>,
    fail: bool,
}

impl ExportHandle for StaticExport {
    fn export(&self) -> ExportFuture<'_> {
        Box::pin(async move {
            if self.fail {
                Err(ExportError::Failed("mock export failure".into()))
            } else {
                Ok(self.bytes.clone())
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SnapshotMode {
    #[default]
    Ok,
    FailExport,
    Hang,
}

#[derive(Default)]
pub(crate) struct MockSnapshots {
    mode: SnapshotMode,
    calls: AtomicUsize,
}

impl MockSnapshots {
    pub(crate) fn new(mode: SnapshotMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SnapshotService for MockSnapshots {
    fn take_snapshot(&self) -> HandleFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode;
        Box::pin(async move {
            if mode == SnapshotMode::Hang {
                std::future::pending::<()>().await;
            }
            Ok(Box::new(StaticExport {
                bytes: b"{\"snapshot\":true}".to_vec(),
                fail: mode == SnapshotMode::FailExport,
            }) as Box<dyn ExportHandle>)
        })
    }
}

#[derive(Default)]
pub(crate) struct MockProfiler {
    fail_export: bool,
    starts: AtomicUsize,
    recording: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl MockProfiler {
    pub(crate) fn failing_export() -> Self {
        Self {
            fail_export: true,
            ..Self::default()
        }
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock().unwrap()
    }
}

impl ProfileService for MockProfiler {
    fn start_profiling<'a>(&'a self, _id: &'a ArtifactId, _record_samples: bool) -> StartFuture<'a> {
        Box::pin(async move {
            if self.recording.swap(true, Ordering::SeqCst) {
                return Err(ExportError::AlreadyProfiling);
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.started_at.lock().unwrap() = Some(Instant::now());
            Ok(())
        })
    }

    fn stop_profiling(&self) -> HandleFuture<'_> {
        Box::pin(async move {
            if !self.recording.swap(false, Ordering::SeqCst) {
                return Err(ExportError::NotProfiling);
            }
            Ok(Box::new(StaticExport {
                bytes: b"{\"profile\":true}".to_vec(),
                fail: self.fail_export,
            }) as Box<dyn ExportHandle>)
        })
    }
}

#[derive(Default)]
pub(crate) struct MemoryWriter {
    written: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    fail: AtomicBool,
}

impl MemoryWriter {
    pub(crate) fn paths(&self) -> Vec<PathBuf> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub(crate) fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl ArtifactWriter for MemoryWriter {
    fn write<'a>(&'a self, path: &'a Path, bytes: Vec<u8>) -> WriteFuture<'a> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WriteError {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "mock"),
                });
            }
            self.written
                .lock()
                .unwrap()
                .push((path.to_path_buf(), bytes));
            Ok(())
        })
    }
}

/// What the policy saw when its action ran.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCapture {
    pub history: Vec<UsageReading>,
    pub profile_ok: bool,
    pub at: Instant,
}

/// Threshold policy that records every action invocation.
pub(crate) struct RecordingPolicy {
    inner: ThresholdPolicy,
    captures: Mutex<Vec<RecordedCapture>>,
}

impl RecordingPolicy {
    pub(crate) fn new(threshold: f64) -> Self {
        Self {
            inner: ThresholdPolicy::new(threshold),
            captures: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn captures(&self) -> Vec<RecordedCapture> {
        self.captures.lock().unwrap().clone()
    }
}

impl EmergencyPolicy for RecordingPolicy {
    fn should_trigger(
        &self,
        previous: UsageReading,
        current: UsageReading,
        history: &[UsageReading],
    ) -> bool {
        self.inner.should_trigger(previous, current, history)
    }

    fn on_captured(&self, report: &CaptureReport) {
        self.captures.lock().unwrap().push(RecordedCapture {
            history: report.history.clone(),
            profile_ok: report.profile.is_ok(),
            at: Instant::now(),
        });
    }
}

/// Sampler replaying a fixed script; `None` entries fail the lookup.
///
/// Integration tests carry a twin in `tests/common/mod.rs`; keep the two in step.
pub(crate) struct ScriptedSampler {
    script: Mutex<VecDeque<Option<f64>>>,
    lookups: AtomicUsize,
}

impl ScriptedSampler {
    pub(crate) fn new(script: impl IntoIterator<Item = Option<f64>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub(crate) fn from_values(values: &[f64]) -> Self {
        Self::new(values.iter().copied().map(Some))
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl UsageSampler for ScriptedSampler {
    fn lookup<'a>(&'a self, _pid: u32, _options: &'a SamplerOptions) -> SamplerFuture<'a> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Some(cpu)) => Ok(UsageReading::new(cpu)),
                Some(None) => Err(SamplerError::Parse("scripted failure".into())),
                // Script exhausted: report an idle process
                None => Ok(UsageReading::default()),
            }
        })
    }
}
