//! Diagnostic artifact naming and persistence.
//!
//! Every capture sequence gets one [`ArtifactId`] (`<hostname><epoch ms>`),
//! shared by its snapshot and profile so the pair can be correlated on disk:
//!
//! ```text
//! <logs_path>/web-011718031234567.snapshot
//! <logs_path>/web-011718031234567.cpuprofile
//! ```

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WriteError;

/// Kind of artifact a capture sequence produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Memory snapshot of the monitored process.
    Snapshot,
    /// Time-boxed CPU profile.
    Profile,
}

impl ArtifactKind {
    /// File extension, including the leading dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Snapshot => ".snapshot",
            Self::Profile => ".cpuprofile",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => write!(f, "snapshot"),
            Self::Profile => write!(f, "profile"),
        }
    }
}

/// Identifier shared by the artifacts of one capture sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate `<hostname><epoch millis>` for the current moment.
    #[must_use]
    pub fn generate() -> Self {
        let host = gethostname::gethostname();
        Self(format!("{}{}", host.to_string_lossy(), epoch_ms()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name for the artifact of `kind`.
    #[must_use]
    pub fn file_name(&self, kind: ArtifactKind) -> String {
        format!("{}{}", self.0, kind.extension())
    }

    /// Full path of the artifact of `kind` inside `dir`.
    #[must_use]
    pub fn path_in(&self, dir: &Path, kind: ArtifactKind) -> PathBuf {
        dir.join(self.file_name(kind))
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

// =============================================================================
// Writer
// =============================================================================

/// Future returned by [`ArtifactWriter::write`].
pub type WriteFuture<'a> = Pin<Box<dyn Future<Output = Result<(), WriteError>> + Send + 'a>>;

/// Persists artifact bytes. Ownership of the bytes moves to the writer.
pub trait ArtifactWriter: Send + Sync {
    fn write<'a>(&'a self, path: &'a Path, bytes: Vec<u8>) -> WriteFuture<'a>;
}

/// Writes artifacts to the local filesystem, creating the directory on demand.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsArtifactWriter;

impl ArtifactWriter for FsArtifactWriter {
    fn write<'a>(&'a self, path: &'a Path, bytes: Vec<u8>) -> WriteFuture<'a> {
        Box::pin(async move {
            let wrap = |source| WriteError {
                path: path.to_path_buf(),
                source,
            };
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(wrap)?;
                }
            }
            let len = bytes.len();
            tokio::fs::write(path, bytes).await.map_err(wrap)?;
            debug!(path = %path.display(), bytes = len, "Artifact written");
            Ok(())
        })
    }
}
