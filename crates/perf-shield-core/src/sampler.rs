//! Per-process CPU usage sampling.
//!
//! The control loop only depends on the [`UsageSampler`] trait. The built-in
//! [`ProcUsageSampler`] covers the common platforms:
//!
//! - **Linux**: reads `utime + stime` from `/proc/<pid>/stat`.
//! - **macOS**: shells out to `ps -o %cpu=` (no unsafe FFI required).
//! - **Other**: returns [`SamplerError::Unsupported`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::SamplerError;

/// Kernel clock ticks per second (`USER_HZ`), fixed at 100 on Linux ABIs.
pub(crate) const CLOCK_TICKS_PER_SEC: u64 = 100;

// =============================================================================
// Readings
// =============================================================================

/// A single CPU utilization sample, in percent of one core.
///
/// Busy multi-threaded processes can exceed 100.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct UsageReading {
    pub cpu: f64,
}

impl UsageReading {
    #[must_use]
    pub const fn new(cpu: f64) -> Self {
        Self { cpu }
    }
}

impl From<f64> for UsageReading {
    fn from(cpu: f64) -> Self {
        Self { cpu }
    }
}

/// Options forwarded to the sampler on every lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerOptions {
    /// Report usage since the previous lookup instead of the lifetime average.
    pub keep_history: bool,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self { keep_history: true }
    }
}

// =============================================================================
// Sampler trait
// =============================================================================

/// Future returned by [`UsageSampler::lookup`].
pub type SamplerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UsageReading, SamplerError>> + Send + 'a>>;

/// Source of point-in-time CPU readings for a process.
pub trait UsageSampler: Send + Sync {
    /// Look up the current CPU usage of `pid`.
    fn lookup<'a>(&'a self, pid: u32, options: &'a SamplerOptions) -> SamplerFuture<'a>;
}

// =============================================================================
// /proc parsing
// =============================================================================

/// Fields of `/proc/<pid>/stat` the shield cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub comm: String,
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
}

impl ProcStat {
    pub(crate) fn busy_ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// Parse `/proc/<pid>/stat` (also valid for `/proc/<pid>/task/<tid>/stat`).
///
/// Format: `pid (comm) state ppid ... utime stime ... starttime ...`.
/// The name can contain spaces and parens, so split on the last ')'.
pub(crate) fn parse_proc_stat(stat: &str) -> Result<ProcStat, SamplerError> {
    let name_start = stat
        .find('(')
        .ok_or_else(|| SamplerError::Parse("missing '(' in stat".into()))?;
    let name_end = stat
        .rfind(')')
        .ok_or_else(|| SamplerError::Parse("missing ')' in stat".into()))?;
    if name_end < name_start {
        return Err(SamplerError::Parse("unbalanced comm field".into()));
    }
    let comm = stat[name_start + 1..name_end].to_string();

    // fields[0] is field 3 (state); utime is field 14, stime 15, starttime 22.
    let fields: Vec<&str> = stat[name_end + 1..].split_whitespace().collect();
    let field = |n: usize| -> Result<u64, SamplerError> {
        fields
            .get(n - 3)
            .ok_or_else(|| SamplerError::Parse(format!("stat has no field {n}")))?
            .parse::<u64>()
            .map_err(|e| SamplerError::Parse(format!("field {n}: {e}")))
    };

    Ok(ProcStat {
        comm,
        utime: field(14)?,
        stime: field(15)?,
        starttime: field(22)?,
    })
}

/// Convert busy ticks accumulated over `elapsed` into percent of one core.
pub(crate) fn ticks_to_percent(ticks: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (ticks as f64 / CLOCK_TICKS_PER_SEC as f64) / secs * 100.0
}

// =============================================================================
// Built-in sampler
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct BusyMark {
    busy_ticks: u64,
    at: Instant,
}

/// Default [`UsageSampler`] backed by the operating system.
///
/// With [`SamplerOptions::keep_history`] set, each lookup reports usage since
/// the previous lookup for the same pid; the first lookup (and every lookup
/// without history) reports the average since the process started.
#[derive(Debug, Default)]
pub struct ProcUsageSampler {
    marks: Mutex<HashMap<u32, BusyMark>>,
}

impl ProcUsageSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the latest busy ticks for `pid`, returning the previous mark.
    fn swap_mark(&self, pid: u32, mark: BusyMark) -> Option<BusyMark> {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, mark)
    }

    #[cfg(target_os = "linux")]
    async fn lookup_linux(
        &self,
        pid: u32,
        options: &SamplerOptions,
    ) -> Result<UsageReading, SamplerError> {
        let raw = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SamplerError::ProcessNotFound(pid),
                _ => SamplerError::Io(e),
            })?;
        let stat = parse_proc_stat(&raw)?;
        let busy_ticks = stat.busy_ticks();

        if options.keep_history {
            let now = Instant::now();
            let previous = self.swap_mark(pid, BusyMark { busy_ticks, at: now });
            if let Some(prev) = previous {
                let delta = busy_ticks.saturating_sub(prev.busy_ticks);
                return Ok(UsageReading::new(ticks_to_percent(
                    delta,
                    now.duration_since(prev.at),
                )));
            }
        }

        let uptime = read_uptime_secs().await?;
        let started = stat.starttime as f64 / CLOCK_TICKS_PER_SEC as f64;
        let alive = Duration::from_secs_f64((uptime - started).max(0.0));
        Ok(UsageReading::new(ticks_to_percent(busy_ticks, alive)))
    }

    #[cfg(target_os = "macos")]
    async fn lookup_macos(&self, pid: u32) -> Result<UsageReading, SamplerError> {
        let output = tokio::process::Command::new("ps")
            .args(["-o", "%cpu=", "-p", &pid.to_string()])
            .output()
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let trimmed = text.trim();
        if !output.status.success() || trimmed.is_empty() {
            return Err(SamplerError::ProcessNotFound(pid));
        }
        trimmed
            .parse::<f64>()
            .map(UsageReading::new)
            .map_err(|e| SamplerError::Parse(format!("ps %cpu: {e}")))
    }
}

impl UsageSampler for ProcUsageSampler {
    fn lookup<'a>(&'a self, pid: u32, options: &'a SamplerOptions) -> SamplerFuture<'a> {
        Box::pin(async move {
            #[cfg(target_os = "linux")]
            {
                self.lookup_linux(pid, options).await
            }
            #[cfg(target_os = "macos")]
            {
                let _ = options; // ps already reports a decayed average
                self.lookup_macos(pid).await
            }
            #[cfg(not(any(target_os = "linux", target_os = "macos")))]
            {
                let _ = (pid, options);
                Err(SamplerError::Unsupported(std::env::consts::OS))
            }
        })
    }
}

/// Seconds since boot from `/proc/uptime`.
#[cfg(target_os = "linux")]
async fn read_uptime_secs() -> Result<f64, SamplerError> {
    let raw = tokio::fs::read_to_string("/proc/uptime").await?;
    raw.split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| SamplerError::Parse(format!("unexpected /proc/uptime: {raw:?}")))
}

// =============================================================================
// Tests
// =============================================================================
