//! Shared test infrastructure for perf-shield-core integration tests.
//!
//! ```ignore
//! mod common;
//! use common::{ScriptedSampler, StaticSnapshots, StaticProfiler};
//! ```

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use perf_shield_core::artifact::{ArtifactId, ArtifactWriter, WriteFuture};
use perf_shield_core::diagnostics::{
    ExportHandle, HandleFuture, JsonExport, ProfileService, SnapshotService, StartFuture,
};
use perf_shield_core::error::{ExportError, SamplerError};
use perf_shield_core::sampler::{SamplerFuture, SamplerOptions, UsageReading, UsageSampler};

/// Replays a fixed list of readings; `None` fails the lookup, an exhausted
/// script reports 0%.
///
/// Mirrors the unit-test sampler in `src/test_support.rs`, which integration
/// tests cannot reach.
pub struct ScriptedSampler {
    script: Mutex<VecDeque<Option<f64>>>,
    lookups: AtomicUsize,
}

impl ScriptedSampler {
    pub fn new(values: &[f64]) -> Self {
        Self::with_failures(values.iter().copied().map(Some))
    }

    pub fn with_failures(script: impl IntoIterator<Item = Option<f64>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl UsageSampler for ScriptedSampler {
    fn lookup<'a>(&'a self, pid: u32, _options: &'a SamplerOptions) -> SamplerFuture<'a> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Some(cpu)) => Ok(UsageReading::new(cpu)),
                Some(None) => Err(SamplerError::ProcessNotFound(pid)),
                None => Ok(UsageReading::default()),
            }
        })
    }
}

/// Snapshot service returning a small JSON document.
#[derive(Default)]
pub struct StaticSnapshots {
    taken: AtomicUsize,
}

impl StaticSnapshots {
    pub fn taken(&self) -> usize {
        self.taken.load(Ordering::SeqCst)
    }
}

impl SnapshotService for StaticSnapshots {
    fn take_snapshot(&self) -> HandleFuture<'_> {
        let n = self.taken.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(Box::new(JsonExport(serde_json::json!({ "snapshot": n }))) as Box<dyn ExportHandle>)
        })
    }
}

/// Profile service that remembers the id it was started with.
#[derive(Default)]
pub struct StaticProfiler {
    recording: AtomicBool,
    current: Mutex<Option<ArtifactId>>,
}

impl ProfileService for StaticProfiler {
    fn start_profiling<'a>(&'a self, id: &'a ArtifactId, _record_samples: bool) -> StartFuture<'a> {
        Box::pin(async move {
            if self.recording.swap(true, Ordering::SeqCst) {
                return Err(ExportError::AlreadyProfiling);
            }
            *self.current.lock().unwrap() = Some(id.clone());
            Ok(())
        })
    }

    fn stop_profiling(&self) -> HandleFuture<'_> {
        Box::pin(async move {
            if !self.recording.swap(false, Ordering::SeqCst) {
                return Err(ExportError::NotProfiling);
            }
            let id = self.current.lock().unwrap().take();
            Ok(Box::new(JsonExport(serde_json::json!({ "profile": id }))) as Box<dyn ExportHandle>)
        })
    }
}

/// Discards artifact bytes.
pub struct NullWriter;

impl ArtifactWriter for NullWriter {
    fn write<'a>(&'a self, _path: &'a Path, _bytes: Vec<u8>) -> WriteFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}
