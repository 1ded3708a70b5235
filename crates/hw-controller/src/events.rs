//! Inputs to and outputs of an experiment controller.

use serde::{Deserialize, Serialize};

use hw_types::{AlgorithmKind, ErrorCause, ExperimentSummary, JobId};

/// Something that happened to an experiment or one of its trials. Fed to
/// [`ExperimentController::run`](crate::ExperimentController::run) over an
/// mpsc channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialEvent {
    /// The trial finished and reported its objective metric.
    Completed { trial_id: JobId, metric: f64 },
    /// The trial failed or was terminated.
    Failed { trial_id: JobId, cause: ErrorCause },
    /// Cancel the trial.
    Cancel { trial_id: JobId },
    Pause,
    Resume,
    /// Stop searching now and finalize with what has been observed.
    EarlyStop,
}

/// Events emitted by the controller for external consumption (logging, UI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExperimentEvent {
    Started {
        algorithm: AlgorithmKind,
        restored_trials: usize,
    },
    TrialLaunched {
        trial_id: JobId,
        trial_number: usize,
        rung: Option<usize>,
    },
    TrialObserved {
        trial_id: JobId,
        /// `None` when the trial failed.
        metric: Option<f64>,
    },
    TrialCanceled {
        trial_id: JobId,
    },
    BestImproved {
        trial_id: JobId,
        metric: f64,
    },
    Paused,
    Resumed,
    Finished {
        reason: String,
        summary: ExperimentSummary,
    },
    Failed {
        message: String,
    },
}
