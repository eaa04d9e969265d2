//! Snapshot and profile services.
//!
//! The orchestrator drives these through [`SnapshotService`] and
//! [`ProfileService`]; the bytes they export are opaque to it. Handles are
//! released by dropping them once exported.
//!
//! Built-in implementations read `/proc` for the monitored pid:
//!
//! - [`ProcSnapshotService`]: memory counters from `/proc/<pid>/status`.
//! - [`ThreadProfileService`]: per-thread CPU ticks from
//!   `/proc/<pid>/task/*/stat`, diffed between start and stop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::{ArtifactId, epoch_ms};
use crate::error::ExportError;

/// Future returned by [`ExportHandle::export`].
pub type ExportFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, ExportError>> + Send + 'a>>;

/// Future resolving to a handle ready for export.
pub type HandleFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn ExportHandle>, ExportError>> + Send + 'a>>;

/// Future returned by [`ProfileService::start_profiling`].
pub type StartFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

/// A captured snapshot or profile waiting to be serialized.
pub trait ExportHandle: Send + Sync {
    fn export(&self) -> ExportFuture<'_>;
}

/// Produces point-in-time memory snapshots.
pub trait SnapshotService: Send + Sync {
    fn take_snapshot(&self) -> HandleFuture<'_>;
}

/// Starts and stops CPU profile recordings.
pub trait ProfileService: Send + Sync {
    fn start_profiling<'a>(&'a self, id: &'a ArtifactId, record_samples: bool) -> StartFuture<'a>;
    fn stop_profiling(&self) -> HandleFuture<'_>;
}

/// Export handle that renders a serializable value as pretty JSON.
#[derive(Debug, Clone)]
pub struct JsonExport<T>(pub T);

impl<T> ExportHandle for JsonExport<T>
where
    T: Serialize + Send + Sync,
{
    fn export(&self) -> ExportFuture<'_> {
        Box::pin(async move { Ok(serde_json::to_vec_pretty(&self.0)?) })
    }
}

// =============================================================================
// Memory snapshot
// =============================================================================

/// Memory counters of a process at one instant (values in kB).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub pid: u32,
    pub taken_at_ms: u64,
    pub vm_rss_kb: u64,
    pub vm_hwm_kb: u64,
    pub vm_size_kb: u64,
    pub vm_data_kb: u64,
    pub rss_anon_kb: u64,
    pub rss_file_kb: u64,
    pub threads: u64,
}

impl MemorySnapshot {
    /// Parse the body of `/proc/<pid>/status`.
    pub(crate) fn from_status(pid: u32, status: &str) -> Self {
        let mut snap = Self {
            pid,
            taken_at_ms: epoch_ms(),
            ..Self::default()
        };
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let Some(num) = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
            else {
                continue;
            };
            match key {
                "VmRSS" => snap.vm_rss_kb = num,
                "VmHWM" => snap.vm_hwm_kb = num,
                "VmSize" => snap.vm_size_kb = num,
                "VmData" => snap.vm_data_kb = num,
                "RssAnon" => snap.rss_anon_kb = num,
                "RssFile" => snap.rss_file_kb = num,
                "Threads" => snap.threads = num,
                _ => {}
            }
        }
        snap
    }
}

/// Default [`SnapshotService`]: memory counters of the monitored pid.
#[derive(Debug, Clone)]
pub struct ProcSnapshotService {
    pid: u32,
}

impl ProcSnapshotService {
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl SnapshotService for ProcSnapshotService {
    fn take_snapshot(&self) -> HandleFuture<'_> {
        Box::pin(async move {
            if !cfg!(target_os = "linux") {
                return Err(ExportError::Unsupported(std::env::consts::OS));
            }
            let status = tokio::fs::read_to_string(format!("/proc/{}/status", self.pid)).await?;
            let snap = MemorySnapshot::from_status(self.pid, &status);
            debug!(pid = self.pid, rss_kb = snap.vm_rss_kb, "Memory snapshot taken");
            Ok(Box::new(JsonExport(snap)) as Box<dyn ExportHandle>)
        })
    }
}

// =============================================================================
// Thread CPU profile
// =============================================================================

/// CPU time one thread spent during the profile window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCpu {
    pub tid: u32,
    pub name: String,
    pub cpu_ms: u64,
}

/// Exported profile: per-thread CPU over the recorded window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuProfile {
    pub id: ArtifactId,
    pub pid: u32,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub total_cpu_ms: u64,
    /// Busiest threads first. Empty unless samples were recorded.
    pub threads: Vec<ThreadCpu>,
}

#[derive(Debug, Clone)]
struct ThreadTicks {
    name: String,
    ticks: u64,
}

#[derive(Debug)]
struct ActiveProfile {
    id: ArtifactId,
    record_samples: bool,
    started: Instant,
    started_at_ms: u64,
    baseline: HashMap<u32, ThreadTicks>,
}

/// Default [`ProfileService`]: diffs per-thread CPU ticks of the monitored pid.
///
/// Only one recording can be active at a time.
#[derive(Debug)]
pub struct ThreadProfileService {
    pid: u32,
    active: Mutex<Option<ActiveProfile>>,
}

impl ThreadProfileService {
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            active: Mutex::new(None),
        }
    }

    /// Whether a recording is in progress.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn take_active(&self) -> Option<ActiveProfile> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl ProfileService for ThreadProfileService {
    fn start_profiling<'a>(&'a self, id: &'a ArtifactId, record_samples: bool) -> StartFuture<'a> {
        Box::pin(async move {
            if self.is_recording() {
                return Err(ExportError::AlreadyProfiling);
            }
            let baseline = read_thread_ticks(self.pid).await?;
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.is_some() {
                return Err(ExportError::AlreadyProfiling);
            }
            *active = Some(ActiveProfile {
                id: id.clone(),
                record_samples,
                started: Instant::now(),
                started_at_ms: epoch_ms(),
                baseline,
            });
            debug!(pid = self.pid, capture_id = %id, "Profile recording started");
            Ok(())
        })
    }

    fn stop_profiling(&self) -> HandleFuture<'_> {
        Box::pin(async move {
            let active = self.take_active().ok_or(ExportError::NotProfiling)?;
            let duration_ms = active.started.elapsed().as_millis() as u64;
            let now = read_thread_ticks(self.pid).await?;
            let profile = build_profile(self.pid, active, &now, duration_ms);
            debug!(
                pid = self.pid,
                capture_id = %profile.id,
                total_cpu_ms = profile.total_cpu_ms,
                "Profile recording stopped"
            );
            Ok(Box::new(JsonExport(profile)) as Box<dyn ExportHandle>)
        })
    }
}

/// Diff two per-thread tick tables into a profile.
///
/// Threads that appeared during the window count from zero.
fn build_profile(
    pid: u32,
    active: ActiveProfile,
    now: &HashMap<u32, ThreadTicks>,
    duration_ms: u64,
) -> CpuProfile {
    let ms_per_tick = 1000 / crate::sampler::CLOCK_TICKS_PER_SEC;
    let mut threads: Vec<ThreadCpu> = now
        .iter()
        .map(|(tid, current)| {
            let before = active.baseline.get(tid).map_or(0, |t| t.ticks);
            ThreadCpu {
                tid: *tid,
                name: current.name.clone(),
                cpu_ms: current.ticks.saturating_sub(before) * ms_per_tick,
            }
        })
        .filter(|t| t.cpu_ms > 0)
        .collect();
    threads.sort_by(|a, b| b.cpu_ms.cmp(&a.cpu_ms).then(a.tid.cmp(&b.tid)));
    let total_cpu_ms = threads.iter().map(|t| t.cpu_ms).sum();
    if !active.record_samples {
        threads.clear();
    }

    CpuProfile {
        id: active.id,
        pid,
        started_at_ms: active.started_at_ms,
        duration_ms,
        total_cpu_ms,
        threads,
    }
}

/// Read busy ticks for every thread of `pid`.
async fn read_thread_ticks(pid: u32) -> Result<HashMap<u32, ThreadTicks>, ExportError> {
    if !cfg!(target_os = "linux") {
        return Err(ExportError::Unsupported(std::env::consts::OS));
    }
    let mut ticks = HashMap::new();
    let mut entries = tokio::fs::read_dir(format!("/proc/{pid}/task")).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Threads can exit between read_dir and read
        let Ok(raw) = tokio::fs::read_to_string(entry.path().join("stat")).await else {
            continue;
        };
        let stat = crate::sampler::parse_proc_stat(&raw)
            .map_err(|e| ExportError::Failed(format!("thread {tid}: {e}")))?;
        ticks.insert(
            tid,
            ThreadTicks {
                ticks: stat.busy_ticks(),
                name: stat.comm,
            },
        );
    }
    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tworker\nThreads:\t7\nVmSize:\t  204800 kB\n\
        VmHWM:\t   51200 kB\nVmRSS:\t   40960 kB\nRssAnon:\t   30000 kB\n\
        RssFile:\t   10960 kB\nVmData:\t  100000 kB\n";

    #[test]
    fn memory_snapshot_parses_status() {
        let snap = MemorySnapshot::from_status(9, STATUS);
        assert_eq!(snap.pid, 9);
        assert_eq!(snap.threads, 7);
        assert_eq!(snap.vm_size_kb, 204_800);
        assert_eq!(snap.vm_hwm_kb, 51_200);
        assert_eq!(snap.vm_rss_kb, 40_960);
        assert_eq!(snap.rss_anon_kb, 30_000);
        assert_eq!(snap.rss_file_kb, 10_960);
        assert_eq!(snap.vm_data_kb, 100_000);
        assert!(snap.taken_at_ms > 0);
    }

    #[test]
    fn memory_snapshot_ignores_unknown_lines() {
        let snap = MemorySnapshot::from_status(1, "Garbage\nState:\tS (sleeping)\n");
        assert_eq!(snap.vm_rss_kb, 0);
    }

    fn ticks(entries: &[(u32, &str, u64)]) -> HashMap<u32, ThreadTicks> {
        entries
            .iter()
            .map(|(tid, name, ticks)| {
                (
                    *tid,
                    ThreadTicks {
                        name: (*name).to_string(),
                        ticks: *ticks,
                    },
                )
            })
            .collect()
    }

    fn active(record_samples: bool, baseline: HashMap<u32, ThreadTicks>) -> ActiveProfile {
        ActiveProfile {
            id: ArtifactId::new("host1"),
            record_samples,
            started: Instant::now(),
            started_at_ms: 1,
            baseline,
        }
    }

    #[test]
    fn build_profile_diffs_and_sorts() {
        let before = ticks(&[(1, "main", 100), (2, "io", 50)]);
        let after = ticks(&[(1, "main", 110), (2, "io", 80), (3, "new", 5)]);
        let profile = build_profile(42, active(true, before), &after, 2000);

        assert_eq!(profile.pid, 42);
        assert_eq!(profile.duration_ms, 2000);
        assert_eq!(profile.total_cpu_ms, 450);
        let order: Vec<u32> = profile.threads.iter().map(|t| t.tid).collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert_eq!(profile.threads[0].cpu_ms, 300);
    }

    #[test]
    fn build_profile_without_samples_keeps_total_only() {
        let before = ticks(&[(1, "main", 0)]);
        let after = ticks(&[(1, "main", 10)]);
        let profile = build_profile(1, active(false, before), &after, 100);
        assert!(profile.threads.is_empty());
        assert_eq!(profile.total_cpu_ms, 100);
    }

    #[tokio::test]
    async fn json_export_renders_value() {
        let bytes = JsonExport(MemorySnapshot::default()).export().await.unwrap();
        let back: MemorySnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, MemorySnapshot::default());
    }

    #[tokio::test]
    async fn stop_without_start_fails() {
        let service = ThreadProfileService::new(std::process::id());
        let err = service.stop_profiling().await.err().unwrap();
        assert!(matches!(err, ExportError::NotProfiling));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn snapshot_own_process() {
        let service = ProcSnapshotService::new(std::process::id());
        let handle = service.take_snapshot().await.unwrap();
        let bytes = handle.export().await.unwrap();
        let snap: MemorySnapshot = serde_json::from_slice(&bytes).unwrap();
        assert!(snap.vm_rss_kb > 0);
        assert!(snap.threads >= 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn profile_own_process_round() {
        let service = ThreadProfileService::new(std::process::id());
        let id = ArtifactId::new("test-profile");
        service.start_profiling(&id, true).await.unwrap();
        assert!(service.is_recording());

        let second = service.start_profiling(&id, true).await;
        assert!(matches!(second, Err(ExportError::AlreadyProfiling)));

        let handle = service.stop_profiling().await.unwrap();
        assert!(!service.is_recording());
        let profile: CpuProfile = serde_json::from_slice(&handle.export().await.unwrap()).unwrap();
        assert_eq!(profile.id, id);
        assert_eq!(profile.pid, std::process::id());
    }
}
