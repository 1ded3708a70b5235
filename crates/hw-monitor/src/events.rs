//! Events published when the scanner terminates a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hw_types::{ExperimentId, JobId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeoutEventKind {
    /// Job forced into Error and its workload deleted.
    Terminated,
    /// Job forced into Error but the workload could not be deleted.
    CleanupFailed { reason: String },
}

/// A single termination performed by the timeout scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    /// Set when the job is a trial.
    pub experiment_id: Option<ExperimentId>,
    pub elapsed_seconds: i64,
    pub threshold_seconds: i64,
    pub kind: TimeoutEventKind,
    pub message: String,
}

impl TimeoutEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        job_id: JobId,
        experiment_id: Option<ExperimentId>,
        elapsed_seconds: i64,
        threshold_seconds: i64,
        kind: TimeoutEventKind,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            job_id,
            experiment_id,
            elapsed_seconds,
            threshold_seconds,
            kind,
            message,
        }
    }

    pub fn cleanup_failed(&self) -> bool {
        matches!(self.kind, TimeoutEventKind::CleanupFailed { .. })
    }
}
