//! Verification harness for fastlocal.
//!
//! This crate provides:
//! - Scenarios: the storage invariants exercised across many threads, on
//!   table-carrying threads, generic threads, or both
//! - Structured logging: a JSONL record per scenario event, plus a validator
//!   for the log contract

#![forbid(unsafe_code)]

pub mod scenarios;
pub mod structured_log;

pub use scenarios::{
    HarnessError, RunSummary, Scenario, ScenarioConfig, ScenarioReport, ThreadMode, run_scenarios,
};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
