//! Error types for perf-shield-core

use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<(String, String)>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a labelled command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for (label, command) in &self.commands {
                let _ = writeln!(output, "    - {label}: {command}");
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for perf-shield-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// CPU usage lookup errors
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    /// Diagnostic capture errors
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Logging setup errors
    #[error("Logging error: {0}")]
    Log(#[from] crate::logging::LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, missing runtime, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Sampler(err) => Some(err.remediation()),
            Self::Capture(CaptureError::Write(_)) | Self::Io(_) => Some(
                Remediation::new("Check that the logs path exists and is writable.")
                    .command("Show config", "perf-shield config")
                    .alternative("Point PERF_SHIELD_LOG_PATH at a writable directory."),
            ),
            Self::Capture(_) => Some(
                Remediation::new("A diagnostic capture failed; the shield keeps sampling.")
                    .alternative("Re-run with --log-level debug to see each capture stage."),
            ),
            Self::Log(_) => Some(
                Remediation::new("Check the log level and log file path, then retry.")
                    .alternative("Valid levels: trace, debug, info, warn, error."),
            ),
            Self::Json(_) | Self::Runtime(_) => None,
        }
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFile { path, .. } => {
                Remediation::new(format!("Verify the config file exists: {}", path.display()))
                    .command("List file", format!("ls -la \"{}\"", path.display()))
            }
            Self::Parse(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Show defaults", "perf-shield config")
                .alternative("Unknown keys are ignored; check spelling of known keys."),
            Self::Serialize(_) => Remediation::new("The effective config could not be rendered."),
            Self::Invalid(_) => Remediation::new(
                "flush_time, sampling_time and snapshot_timeout must be between 1 and 86400 seconds.",
            )
            .command("Show defaults", "perf-shield config"),
        }
    }
}

/// CPU usage lookup errors
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("process {0} not found")]
    ProcessNotFound(u32),

    #[error("malformed process stats: {0}")]
    Parse(String),

    #[error("failed to read process stats: {0}")]
    Io(#[from] std::io::Error),

    #[error("CPU usage lookup is not supported on {0}")]
    Unsupported(&'static str),
}

impl SamplerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ProcessNotFound(pid) => {
                Remediation::new(format!("Process {pid} is not running; pass a live pid."))
                    .command("Check process", format!("ps -p {pid}"))
            }
            Self::Parse(_) | Self::Io(_) => {
                Remediation::new("Process stats could not be read; check /proc permissions.")
                    .alternative("Watching another user's process may require elevated rights.")
            }
            Self::Unsupported(os) => Remediation::new(format!(
                "The built-in sampler does not support {os}; supply a custom UsageSampler."
            )),
        }
    }
}

/// Snapshot/profile export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("a profile is already being recorded")]
    AlreadyProfiling,

    #[error("no profile is being recorded")]
    NotProfiling,

    #[error("export not supported on {0}")]
    Unsupported(&'static str),

    #[error("export failed: {0}")]
    Failed(String),

    #[error("I/O error during export: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Artifact persistence error
#[derive(Error, Debug)]
#[error("failed to write artifact {}: {source}", path.display())]
pub struct WriteError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

/// Failure of one stage of a capture sequence
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("snapshot export failed: {0}")]
    Snapshot(ExportError),

    #[error("profile export failed: {0}")]
    Profile(ExportError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("snapshot stage did not finish within {0:?}")]
    SnapshotTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_render_includes_sections() {
        let text = Remediation::new("Do the thing")
            .command("Check", "perf-shield config")
            .alternative("Or not")
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("Do the thing"));
        assert!(text.contains("- Check: perf-shield config"));
        assert!(text.contains("- Or not"));
    }

    #[test]
    fn sampler_error_converts_and_has_remediation() {
        let err: Error = SamplerError::ProcessNotFound(42).into();
        assert_eq!(err.to_string(), "Sampler error: process 42 not found");
        let hint = err.remediation().unwrap();
        assert!(hint.summary.contains("42"));
    }

    #[test]
    fn write_error_display_names_path() {
        let err = CaptureError::from(WriteError {
            path: PathBuf::from("/tmp/x.snapshot"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });
        let msg = err.to_string();
        assert!(msg.contains("/tmp/x.snapshot"), "{msg}");
        assert!(msg.contains("denied"), "{msg}");
    }

    #[test]
    fn snapshot_timeout_display() {
        let err = CaptureError::SnapshotTimeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "snapshot stage did not finish within 30s");
    }

    #[test]
    fn invalid_config_remediation_mentions_fields() {
        let hint = ConfigError::Invalid("flush_time".into()).remediation();
        assert!(hint.summary.contains("flush_time"));
    }
}
