//! # hw-controller
//!
//! Drives HyperWatch experiments end to end. An [`ExperimentController`]
//! owns one experiment's search algorithm, issues trials up to the
//! concurrency cap and budget, folds results back into the search and
//! finalizes the experiment once it stops. The [`ControllerRegistry`]
//! serializes access per experiment and receives trials terminated by the
//! timeout scanner.

pub mod controller;
pub mod events;
pub mod registry;

pub use controller::{ControllerContext, ExperimentController};
pub use events::{ExperimentEvent, TrialEvent};
pub use registry::ControllerRegistry;
