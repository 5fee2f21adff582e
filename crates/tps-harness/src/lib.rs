//! Scenario harness for thread-private storage.
//!
//! This crate provides:
//! - Scenarios: multi-thread lifecycle runs against a fresh domain
//! - Structured logging: JSONL records for every domain call a scenario makes
//! - The `tps-harness` binary, which also hosts the process-terminating
//!   fault-reporting checks

pub mod scenario;
pub mod structured_log;

pub use scenario::{ScenarioError, ScenarioKind, ScenarioReport, run_scenario};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
