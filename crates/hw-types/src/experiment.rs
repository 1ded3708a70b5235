//! Experiment configuration and lifecycle record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::HwError;
use crate::job::JobId;
use crate::params::ParameterAssignment;

/// Unique experiment identifier.
pub type ExperimentId = Uuid;

/// Which search algorithm drives the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    Bayesian,
    HyperBand,
}

impl FromStr for AlgorithmKind {
    type Err = HwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bayesian" => Ok(AlgorithmKind::Bayesian),
            "hyperband" => Ok(AlgorithmKind::HyperBand),
            other => Err(HwError::Configuration(format!(
                "unknown algorithm kind '{other}' (expected bayesian or hyperband)"
            ))),
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmKind::Bayesian => write!(f, "bayesian"),
            AlgorithmKind::HyperBand => write!(f, "hyperband"),
        }
    }
}

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// `true` if `candidate` strictly improves on `incumbent`.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            ObjectiveDirection::Maximize => candidate > incumbent,
            ObjectiveDirection::Minimize => candidate < incumbent,
        }
    }

    /// Sentinel recorded for trials that failed or timed out.
    pub fn worst_value(&self) -> f64 {
        match self {
            ObjectiveDirection::Maximize => f64::MIN,
            ObjectiveDirection::Minimize => f64::MAX,
        }
    }

    /// Orders metrics best-first. NaN sorts last.
    pub fn cmp_best_first(&self, a: f64, b: f64) -> Ordering {
        let ord = match (a.is_nan(), b.is_nan()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        };
        match self {
            ObjectiveDirection::Maximize => ord.reverse(),
            ObjectiveDirection::Minimize => ord,
        }
    }
}

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentStatus {
    Initializing,
    Searching,
    Finalizing,
    Done,
    Error,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Done | ExperimentStatus::Error)
    }
}

/// How much searching an experiment may do.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchBudget {
    /// Maximum number of trials to launch.
    pub max_trials: usize,
    /// Optional cap on total resource units (e.g. epochs) across all trials.
    pub max_resource_units: Option<f64>,
}

impl Default for SearchBudget {
    fn default() -> Self {
        Self {
            max_trials: 20,
            max_resource_units: None,
        }
    }
}

/// Persisted experiment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub name: String,
    /// Schema target (network/model family) the parameter specs are read for.
    pub target: String,
    pub algorithm_kind: AlgorithmKind,
    pub budget: SearchBudget,
    pub concurrency_cap: usize,
    pub status: ExperimentStatus,
    /// Metric name to optimize (e.g. "val_accuracy").
    pub metric_name: String,
    pub direction: ObjectiveDirection,
    /// Parameters the search tunes. Empty means every spec the schema returns.
    #[serde(default)]
    pub parameters: Vec<String>,
    pub best_trial_id: Option<JobId>,
    pub best_metric: Option<f64>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub early_stop_requested: bool,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExperimentRecord {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        kind: AlgorithmKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            target: target.into(),
            algorithm_kind: kind,
            budget: SearchBudget::default(),
            concurrency_cap: 2,
            status: ExperimentStatus::Initializing,
            metric_name: "val_accuracy".to_string(),
            direction: ObjectiveDirection::Maximize,
            parameters: Vec::new(),
            best_trial_id: None,
            best_metric: None,
            paused: false,
            early_stop_requested: false,
            message: None,
            created_at: now,
            finished_at: None,
        }
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.budget.max_trials = n;
        self
    }

    pub fn with_resource_budget(mut self, units: f64) -> Self {
        self.budget.max_resource_units = Some(units);
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency_cap = n;
        self
    }

    pub fn with_objective(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.metric_name = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_parameters(mut self, names: Vec<String>) -> Self {
        self.parameters = names;
        self
    }

    pub fn mark_searching(&mut self) {
        self.status = ExperimentStatus::Searching;
    }

    pub fn mark_finalizing(&mut self) {
        self.status = ExperimentStatus::Finalizing;
    }

    pub fn mark_done(&mut self, at: DateTime<Utc>) {
        self.status = ExperimentStatus::Done;
        self.finished_at = Some(at);
    }

    pub fn mark_failed(&mut self, error: String, at: DateTime<Utc>) {
        self.status = ExperimentStatus::Error;
        self.finished_at = Some(at);
        self.message = Some(error);
    }

    /// Update the best trial if `metric` improves on the current best.
    /// Returns `true` when the best trial changed.
    pub fn update_best(&mut self, trial_id: JobId, metric: f64) -> bool {
        let improves = match self.best_metric {
            None => true,
            Some(current) => self.direction.is_better(metric, current),
        };
        if improves {
            self.best_trial_id = Some(trial_id);
            self.best_metric = Some(metric);
        }
        improves
    }
}

/// Final outcome of an experiment, available once it is Done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: ExperimentId,
    pub status: ExperimentStatus,
    pub best_trial_id: Option<JobId>,
    pub best_metric: Option<f64>,
    pub best_assignment: Option<ParameterAssignment>,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub trials_canceled: usize,
}
