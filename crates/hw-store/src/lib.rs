//! # hw-store
//!
//! Interfaces to the collaborators HyperWatch depends on but does not own:
//! the durable state store, the compute-resource manager and the parameter
//! schema provider. In-memory implementations back tests and the local
//! service binary.

pub mod clock;
pub mod memory;
pub mod retry;

use async_trait::async_trait;

use hw_types::{
    CustomRanges, ExperimentId, ExperimentRecord, HwResult, JobId, JobRecord, JobStatus,
    ParameterSpec, StatusHistoryEntry,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::{MemoryComputeManager, MemoryStateStore, StaticSchemaProvider};
pub use retry::{with_backoff, RetryPolicy};

/// Durable store for job, trial and experiment records.
///
/// The store is the sole source of truth after a restart; callers keep no
/// state that cannot be rebuilt from it.
#[async_trait]
pub trait StateStore: Send + Sync {
    // -- Jobs ---------------------------------------------------------------

    async fn get_job(&self, id: JobId) -> HwResult<Option<JobRecord>>;

    /// Insert or replace a job record.
    async fn put_job(&self, job: JobRecord) -> HwResult<()>;

    /// Set a job's status and append the matching history entry.
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> HwResult<JobRecord>;

    /// Atomically set `status` only if the job is currently `expected`.
    /// Returns `false` (and writes nothing) if the status changed underneath.
    async fn compare_and_set_status(
        &self,
        id: JobId,
        expected: JobStatus,
        status: JobStatus,
        message: Option<String>,
    ) -> HwResult<bool>;

    async fn append_history(&self, id: JobId, entry: StatusHistoryEntry) -> HwResult<()>;

    /// Drop a job's status history (resume / re-attach timer reset).
    async fn clear_history(&self, id: JobId) -> HwResult<()>;

    /// Atomically move a trial from `expected` to Done and store its metric.
    /// Returns `false` (and writes nothing) if the status changed underneath.
    async fn complete_trial(&self, id: JobId, expected: JobStatus, metric: f64) -> HwResult<bool>;

    /// All jobs (plain and trials) currently Pending or Running.
    async fn list_active_jobs(&self) -> HwResult<Vec<JobRecord>>;

    /// Trials of one experiment, ordered by trial number.
    async fn list_trials(&self, experiment_id: ExperimentId) -> HwResult<Vec<JobRecord>>;

    // -- Experiments --------------------------------------------------------

    async fn get_experiment(&self, id: ExperimentId) -> HwResult<Option<ExperimentRecord>>;

    async fn put_experiment(&self, experiment: ExperimentRecord) -> HwResult<()>;

    async fn list_experiments(&self) -> HwResult<Vec<ExperimentRecord>>;

    async fn get_custom_ranges(&self, experiment_id: ExperimentId) -> HwResult<CustomRanges>;

    async fn set_custom_ranges(
        &self,
        experiment_id: ExperimentId,
        ranges: CustomRanges,
    ) -> HwResult<()>;
}

/// Launches and reclaims the workloads backing jobs.
#[async_trait]
pub trait ComputeResourceManager: Send + Sync {
    /// Start the workload for a job.
    async fn launch(&self, job: &JobRecord) -> HwResult<()>;

    /// Delete the workload. `Ok(false)` means the manager could not find or
    /// remove it.
    async fn delete(&self, job_id: JobId) -> HwResult<bool>;
}

/// Source of parameter schemas for a training target.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn get_param_specs(&self, target: &str) -> HwResult<Vec<ParameterSpec>>;
}
