//! Shield configuration.
//!
//! A [`ShieldConfig`] is built once at startup and never changes afterwards.
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults (`logs_path` honours `PERF_SHIELD_LOG_PATH`)
//! 2. An optional TOML file ([`ShieldConfig::load_from`])
//! 3. Caller overrides ([`ShieldOverrides`]), merged shallowly per key
//!
//! ```toml
//! logs_path = "/var/log/shield"
//! sampling_time = 60
//! flush_time = 3
//! cache_max_limit = 100
//! cpu_threshold = 50.0
//!
//! [cpu_usage_options]
//! keep_history = true
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sampler::SamplerOptions;

/// Environment variable overriding the default artifact directory.
pub const LOG_PATH_ENV: &str = "PERF_SHIELD_LOG_PATH";

/// Default seconds a CPU profile records for.
pub const DEFAULT_SAMPLING_TIME_SECS: u64 = 60;
/// Default seconds between control loop ticks.
pub const DEFAULT_FLUSH_TIME_SECS: u64 = 3;
/// Default history capacity.
pub const DEFAULT_CACHE_MAX_LIMIT: usize = 100;
/// Default threshold for the built-in two-sample policy.
pub const DEFAULT_CPU_THRESHOLD: f64 = 50.0;
/// Default bound on the snapshot stage of a capture.
pub const DEFAULT_SNAPSHOT_TIMEOUT_SECS: u64 = 30;

/// Effective shield configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    /// Directory artifacts are written to.
    pub logs_path: PathBuf,
    /// Seconds a CPU profile capture runs.
    pub sampling_time: u64,
    /// Seconds between control loop ticks.
    pub flush_time: u64,
    /// Maximum readings kept in history.
    pub cache_max_limit: usize,
    /// Threshold (percent of one core) for the built-in policy.
    pub cpu_threshold: f64,
    /// Seconds before an unfinished snapshot stage is abandoned.
    pub snapshot_timeout: u64,
    /// Process to monitor; the current process when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Options passed through to the usage sampler.
    pub cpu_usage_options: SamplerOptions,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            logs_path: default_logs_path(),
            sampling_time: DEFAULT_SAMPLING_TIME_SECS,
            flush_time: DEFAULT_FLUSH_TIME_SECS,
            cache_max_limit: DEFAULT_CACHE_MAX_LIMIT,
            cpu_usage_options: SamplerOptions::default(),
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT_SECS,
            pid: None,
        }
    }
}

/// Caller-supplied overrides. Every set field replaces the base value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldOverrides {
    pub logs_path: Option<PathBuf>,
    pub sampling_time: Option<u64>,
    pub flush_time: Option<u64>,
    pub cache_max_limit: Option<usize>,
    pub cpu_usage_options: Option<SamplerOptions>,
    pub cpu_threshold: Option<f64>,
    pub snapshot_timeout: Option<u64>,
    pub pid: Option<u32>,
}

impl ShieldConfig {
    /// Defaults merged with `overrides`, validated.
    pub fn from_overrides(overrides: ShieldOverrides) -> Result<Self, ConfigError> {
        let config = Self::default().merged(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file; missing keys take their defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without validating.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Shallow merge: each field set in `overrides` wins.
    #[must_use]
    pub fn merged(mut self, overrides: ShieldOverrides) -> Self {
        let ShieldOverrides {
            logs_path,
            sampling_time,
            flush_time,
            cache_max_limit,
            cpu_usage_options,
            cpu_threshold,
            snapshot_timeout,
            pid,
        } = overrides;

        if let Some(v) = logs_path {
            self.logs_path = v;
        }
        if let Some(v) = sampling_time {
            self.sampling_time = v;
        }
        if let Some(v) = flush_time {
            self.flush_time = v;
        }
        if let Some(v) = cache_max_limit {
            self.cache_max_limit = v;
        }
        if let Some(v) = cpu_usage_options {
            self.cpu_usage_options = v;
        }
        if let Some(v) = cpu_threshold {
            self.cpu_threshold = v;
        }
        if let Some(v) = snapshot_timeout {
            self.snapshot_timeout = v;
        }
        if pid.is_some() {
            self.pid = pid;
        }
        self
    }

    /// Reject values the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("flush_time", self.flush_time)?;
        check_secs("sampling_time", self.sampling_time)?;
        check_secs("snapshot_timeout", self.snapshot_timeout)?;
        if !self.cpu_threshold.is_finite() || self.cpu_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cpu_threshold must be a non-negative number, got {}",
                self.cpu_threshold
            )));
        }
        Ok(())
    }

    /// Tick period of the control loop.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_time)
    }

    /// How long a profile records for.
    #[must_use]
    pub fn sampling_duration(&self) -> Duration {
        Duration::from_secs(self.sampling_time)
    }

    /// Bound on the snapshot stage.
    #[must_use]
    pub fn snapshot_deadline(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout)
    }

    /// Pid the shield watches.
    #[must_use]
    pub fn monitored_pid(&self) -> u32 {
        self.pid.unwrap_or_else(std::process::id)
    }
}

/// Upper bound for every timer setting, in seconds (one day).
pub const MAX_TIMER_SECS: u64 = 24 * 60 * 60;

fn check_secs(name: &str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid(format!("{name} must be at least 1 second")));
    }
    if secs > MAX_TIMER_SECS {
        return Err(ConfigError::Invalid(format!(
            "{name} must be at most {MAX_TIMER_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}

/// `$PERF_SHIELD_LOG_PATH`, else the current directory.
#[must_use]
pub fn default_logs_path() -> PathBuf {
    logs_path_from(std::env::var_os(LOG_PATH_ENV))
}

fn logs_path_from(env: Option<OsString>) -> PathBuf {
    env.filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}
