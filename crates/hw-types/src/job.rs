//! Job and trial records with their append-only status history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{HwError, HwResult};
use crate::experiment::ExperimentId;
use crate::params::ParameterAssignment;

/// Unique job identifier. Trials are jobs too.
pub type JobId = Uuid;

/// Lifecycle status of a job or trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Pending,
    Running,
    Paused,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    /// Done, Error and Canceled are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Canceled)
    }

    /// Jobs the timeout scanner watches.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Pending => 1,
            JobStatus::Running | JobStatus::Paused => 2,
            JobStatus::Done | JobStatus::Error | JobStatus::Canceled => 3,
        }
    }

    /// Transitions are monotonic; pausing and resuming are the only way back.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (JobStatus::Paused, _) | (_, JobStatus::Paused) => true,
            (current, next) => next.rank() >= current.rank(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One status report. History is append-only and ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub message: Option<String>,
}

impl StatusHistoryEntry {
    pub fn new(timestamp: DateTime<Utc>, status: JobStatus, message: Option<String>) -> Self {
        Self {
            timestamp,
            status,
            message,
        }
    }
}

/// Whether a job is a standalone job or a trial belonging to an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Plain,
    Trial {
        experiment_id: ExperimentId,
        trial_number: usize,
    },
}

/// Why a job ended in `Error`. Rendered into the job's terminal message so
/// users can tell a timeout from a crash from a cleanup problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorCause {
    Timeout {
        elapsed_seconds: i64,
        threshold_seconds: i64,
    },
    ExplicitFailure(String),
    ResourceCleanup(String),
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::Timeout {
                elapsed_seconds,
                threshold_seconds,
            } => write!(
                f,
                "Terminated due to timeout: no status updates for {elapsed_seconds}s (limit {threshold_seconds}s)"
            ),
            ErrorCause::ExplicitFailure(reason) => write!(f, "Job failed: {reason}"),
            ErrorCause::ResourceCleanup(reason) => {
                write!(f, "Compute resource cleanup failed: {reason}")
            }
        }
    }
}

/// Persisted job record. Trials carry their assignment, metric and HyperBand rung.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub status_history: Vec<StatusHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub parameter_assignment: Option<ParameterAssignment>,
    pub metric: Option<f64>,
    /// HyperBand rung the trial is running at.
    pub rung: Option<usize>,
    /// Resource budget (e.g. epochs) granted to the trial.
    pub resource: Option<f64>,
    pub message: Option<String>,
    /// Status the job had when it was paused; cleared once it leaves Paused.
    #[serde(default)]
    pub paused_from: Option<JobStatus>,
}

impl JobRecord {
    pub fn new_plain(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: JobKind::Plain,
            status: JobStatus::Created,
            status_history: Vec::new(),
            created_at: now,
            last_modified: now,
            parameter_assignment: None,
            metric: None,
            rung: None,
            resource: None,
            message: None,
            paused_from: None,
        }
    }

    pub fn new_trial(
        experiment_id: ExperimentId,
        trial_number: usize,
        assignment: ParameterAssignment,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::Trial {
                experiment_id,
                trial_number,
            },
            status: JobStatus::Pending,
            parameter_assignment: Some(assignment),
            ..Self::new_plain(now)
        }
    }

    pub fn is_trial(&self) -> bool {
        matches!(self.kind, JobKind::Trial { .. })
    }

    pub fn experiment_id(&self) -> Option<ExperimentId> {
        match self.kind {
            JobKind::Trial { experiment_id, .. } => Some(experiment_id),
            JobKind::Plain => None,
        }
    }

    pub fn trial_number(&self) -> Option<usize> {
        match self.kind {
            JobKind::Trial { trial_number, .. } => Some(trial_number),
            JobKind::Plain => None,
        }
    }

    /// Timestamp of the latest status report, or `last_modified` if the job
    /// has never reported.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.status_history
            .iter()
            .map(|entry| entry.timestamp)
            .max()
            .unwrap_or(self.last_modified)
    }

    /// Apply a status report, enforcing monotonic transitions.
    pub fn record_status(
        &mut self,
        status: JobStatus,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> HwResult<()> {
        if self.status != status && !self.status.can_transition_to(status) {
            return Err(HwError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        if status == JobStatus::Paused {
            if self.status != JobStatus::Paused {
                self.paused_from = Some(self.status);
            }
        } else {
            self.paused_from = None;
        }
        self.status = status;
        if message.is_some() {
            self.message = message.clone();
        }
        self.append_history(StatusHistoryEntry::new(at, status, message));
        Ok(())
    }

    /// Append a history entry. Out-of-order timestamps are clamped to the last
    /// entry so the history stays ascending.
    pub fn append_history(&mut self, mut entry: StatusHistoryEntry) {
        if let Some(last) = self.status_history.last() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }
        self.last_modified = self.last_modified.max(entry.timestamp);
        self.status_history.push(entry);
    }

    /// Resume-reset: drop all history so staleness is measured from now on.
    pub fn clear_history(&mut self, now: DateTime<Utc>) {
        self.status_history.clear();
        self.last_modified = now;
    }
}
