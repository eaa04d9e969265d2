//! perf-shield-core: CPU watchdog that captures diagnostics under sustained load
//!
//! A control loop samples the CPU usage of one process on a fixed period.
//! When the emergency policy fires, a memory snapshot and a time-boxed CPU
//! profile are captured and written to disk under a shared id, and the
//! policy's action is invoked with the history that caused the trigger.
//!
//! # Architecture
//!
//! ```text
//! interval(flush_time) → UsageSampler → HistoryBuffer → EmergencyPolicy
//!                                                            ↓ trigger
//!                               CaptureOrchestrator (one sequence at a time)
//!                                 ├─ SnapshotService → ArtifactWriter  <id>.snapshot
//!                                 └─ ProfileService  → ArtifactWriter  <id>.cpuprofile
//!                                                            ↓
//!                                              EmergencyPolicy::on_captured
//! ```
//!
//! # Modules
//!
//! - `shield`: control loop, builder, `start` entry point
//! - `capture`: capture orchestrator and its re-entrancy guard
//! - `policy`: trigger predicate and post-capture action
//! - `history`: bounded FIFO of readings
//! - `sampler`: CPU usage lookup
//! - `diagnostics`: snapshot and profile services
//! - `artifact`: artifact naming and persistence
//! - `config`: configuration, defaults, overrides
//! - `logging`: tracing subscriber setup
//! - `error`: error types and remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod artifact;
pub mod capture;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod history;
pub mod logging;
pub mod policy;
pub mod sampler;
pub mod shield;

#[cfg(test)]
mod test_support;

pub use capture::{CaptureOrchestrator, CaptureReport, CaptureState};
pub use config::{ShieldConfig, ShieldOverrides};
pub use error::{Error, Result};
pub use policy::{EmergencyPolicy, FnPolicy, ThresholdPolicy};
pub use sampler::UsageReading;
pub use shield::{Shield, ShieldHandle, ShieldStats, start};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
