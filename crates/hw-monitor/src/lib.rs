//! Job lifecycle monitoring for HyperWatch.
//!
//! Provides:
//! - Staleness detection for Pending/Running jobs that stopped reporting
//! - Forced termination with compute cleanup and failure hand-off for trials
//! - Runtime-adjustable threshold and on/off toggle
//! - Timeout events published over a channel

pub mod config;
pub mod events;
pub mod scanner;

pub use config::{MonitorConfig, MonitorHandle};
pub use events::{TimeoutEvent, TimeoutEventKind};
pub use scanner::{is_timed_out, TimeoutScanner, TrialFailureSink};
