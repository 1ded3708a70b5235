//! In-process implementations of the collaborator traits.
//!
//! [`MemoryStateStore`] keeps records in sharded concurrent maps; every
//! per-job operation runs under that job's shard lock, which gives the
//! read-verify-write atomicity the timeout scanner relies on.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use hw_types::{
    CustomRanges, ExperimentId, ExperimentRecord, HwError, HwResult, JobId, JobRecord, JobStatus,
    ParameterSpec, StatusHistoryEntry,
};

use crate::clock::{Clock, SystemClock};
use crate::{ComputeResourceManager, SchemaProvider, StateStore};

/// Serializable dump of a [`MemoryStateStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub jobs: Vec<JobRecord>,
    pub experiments: Vec<ExperimentRecord>,
    pub custom_ranges: HashMap<ExperimentId, CustomRanges>,
}

/// Concurrent in-memory state store.
#[derive(Debug)]
pub struct MemoryStateStore {
    jobs: DashMap<JobId, JobRecord>,
    experiments: DashMap<ExperimentId, ExperimentRecord>,
    custom_ranges: DashMap<ExperimentId, CustomRanges>,
    clock: Arc<dyn Clock>,
    /// Remaining injected transient failures per job.
    faults: Mutex<HashMap<JobId, usize>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: DashMap::new(),
            experiments: DashMap::new(),
            custom_ranges: DashMap::new(),
            clock,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild a store from a snapshot, as after a process restart.
    pub fn from_snapshot(snapshot: StoreSnapshot, clock: Arc<dyn Clock>) -> Self {
        let store = Self::with_clock(clock);
        for job in snapshot.jobs {
            store.jobs.insert(job.id, job);
        }
        for experiment in snapshot.experiments {
            store.experiments.insert(experiment.id, experiment);
        }
        for (id, ranges) in snapshot.custom_ranges {
            store.custom_ranges.insert(id, ranges);
        }
        info!(
            jobs = store.jobs.len(),
            experiments = store.experiments.len(),
            "state store restored from snapshot"
        );
        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            jobs: self.jobs.iter().map(|e| e.value().clone()).collect(),
            experiments: self.experiments.iter().map(|e| e.value().clone()).collect(),
            custom_ranges: self
                .custom_ranges
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        }
    }

    pub fn to_json(&self) -> HwResult<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn from_json(json: &str, clock: Arc<dyn Clock>) -> HwResult<Self> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot, clock))
    }

    /// Make the next `count` operations touching `job_id` fail with a
    /// transient store error.
    pub fn inject_faults(&self, job_id: JobId, count: usize) {
        self.faults.lock().insert(job_id, count);
    }

    fn check_fault(&self, job_id: JobId) -> HwResult<()> {
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.get_mut(&job_id) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(%job_id, remaining = *remaining, "injected store fault");
                return Err(HwError::TransientStore(format!(
                    "injected failure for job {job_id}"
                )));
            }
        }
        Ok(())
    }

    fn not_found(job_id: JobId) -> HwError {
        HwError::NotFound(format!("job {job_id}"))
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_job(&self, id: JobId) -> HwResult<Option<JobRecord>> {
        self.check_fault(id)?;
        Ok(self.jobs.get(&id).map(|job| job.clone()))
    }

    async fn put_job(&self, job: JobRecord) -> HwResult<()> {
        self.check_fault(job.id)?;
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> HwResult<JobRecord> {
        self.check_fault(id)?;
        let now = self.clock.now();
        let mut job = self.jobs.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        job.record_status(status, message, now)?;
        Ok(job.clone())
    }

    async fn compare_and_set_status(
        &self,
        id: JobId,
        expected: JobStatus,
        status: JobStatus,
        message: Option<String>,
    ) -> HwResult<bool> {
        self.check_fault(id)?;
        let now = self.clock.now();
        let mut job = self.jobs.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if job.status != expected {
            debug!(%id, %expected, actual = %job.status, "status changed before write; skipping");
            return Ok(false);
        }
        job.record_status(status, message, now)?;
        Ok(true)
    }

    async fn append_history(&self, id: JobId, entry: StatusHistoryEntry) -> HwResult<()> {
        self.check_fault(id)?;
        let mut job = self.jobs.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        job.append_history(entry);
        Ok(())
    }

    async fn clear_history(&self, id: JobId) -> HwResult<()> {
        self.check_fault(id)?;
        let now = self.clock.now();
        let mut job = self.jobs.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        job.clear_history(now);
        Ok(())
    }

    async fn complete_trial(&self, id: JobId, expected: JobStatus, metric: f64) -> HwResult<bool> {
        self.check_fault(id)?;
        let now = self.clock.now();
        let mut job = self.jobs.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if job.status != expected {
            debug!(%id, %expected, actual = %job.status, "status changed before completion; skipping");
            return Ok(false);
        }
        job.record_status(JobStatus::Done, None, now)?;
        job.metric = Some(metric);
        Ok(true)
    }

    async fn list_active_jobs(&self) -> HwResult<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|job| job.status.is_active())
            .map(|job| job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn list_trials(&self, experiment_id: ExperimentId) -> HwResult<Vec<JobRecord>> {
        let mut trials: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|job| job.experiment_id() == Some(experiment_id))
            .map(|job| job.clone())
            .collect();
        trials.sort_by_key(|job| job.trial_number());
        Ok(trials)
    }

    async fn get_experiment(&self, id: ExperimentId) -> HwResult<Option<ExperimentRecord>> {
        Ok(self.experiments.get(&id).map(|e| e.clone()))
    }

    async fn put_experiment(&self, experiment: ExperimentRecord) -> HwResult<()> {
        self.experiments.insert(experiment.id, experiment);
        Ok(())
    }

    async fn list_experiments(&self) -> HwResult<Vec<ExperimentRecord>> {
        let mut experiments: Vec<ExperimentRecord> =
            self.experiments.iter().map(|e| e.clone()).collect();
        experiments.sort_by_key(|e| e.created_at);
        Ok(experiments)
    }

    async fn get_custom_ranges(&self, experiment_id: ExperimentId) -> HwResult<CustomRanges> {
        Ok(self
            .custom_ranges
            .get(&experiment_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn set_custom_ranges(
        &self,
        experiment_id: ExperimentId,
        ranges: CustomRanges,
    ) -> HwResult<()> {
        self.custom_ranges.insert(experiment_id, ranges);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compute manager
// ---------------------------------------------------------------------------

/// Compute manager that records launches and deletions instead of talking to
/// a cluster. Deletion outcomes can be scripted per job.
#[derive(Debug, Default)]
pub struct MemoryComputeManager {
    launched: RwLock<Vec<JobId>>,
    deleted: RwLock<Vec<JobId>>,
    /// Jobs whose deletion returns an error.
    failing: RwLock<HashSet<JobId>>,
    /// Jobs whose deletion reports "not removed".
    missing: RwLock<HashSet<JobId>>,
}

impl MemoryComputeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deletes_for(&self, job_id: JobId) {
        self.failing.write().insert(job_id);
    }

    pub fn report_missing_for(&self, job_id: JobId) {
        self.missing.write().insert(job_id);
    }

    pub fn launched(&self) -> Vec<JobId> {
        self.launched.read().clone()
    }

    pub fn deleted(&self) -> Vec<JobId> {
        self.deleted.read().clone()
    }
}

#[async_trait]
impl ComputeResourceManager for MemoryComputeManager {
    async fn launch(&self, job: &JobRecord) -> HwResult<()> {
        self.launched.write().push(job.id);
        Ok(())
    }

    async fn delete(&self, job_id: JobId) -> HwResult<bool> {
        if self.failing.read().contains(&job_id) {
            return Err(HwError::TerminationFailure {
                job_id: job_id.to_string(),
                message: "compute backend rejected delete".to_string(),
            });
        }
        if self.missing.read().contains(&job_id) {
            return Ok(false);
        }
        self.deleted.write().push(job_id);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Schema provider
// ---------------------------------------------------------------------------

/// Schema provider serving fixed spec lists per target.
#[derive(Debug, Default)]
pub struct StaticSchemaProvider {
    schemas: HashMap<String, Vec<ParameterSpec>>,
}

impl StaticSchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: impl Into<String>, specs: Vec<ParameterSpec>) -> Self {
        self.schemas.insert(target.into(), specs);
        self
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn get_param_specs(&self, target: &str) -> HwResult<Vec<ParameterSpec>> {
        self.schemas
            .get(target)
            .cloned()
            .ok_or_else(|| HwError::Configuration(format!("no parameter schema for target '{target}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, Utc};

    fn running_job(store: &MemoryStateStore) -> JobId {
        let mut job = JobRecord::new_plain(Utc::now());
        job.status = JobStatus::Running;
        let id = job.id;
        store.jobs.insert(id, job);
        id
    }

    #[tokio::test]
    async fn update_status_appends_history_with_clock_time() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStateStore::with_clock(clock.clone());
        let id = running_job(&store);

        clock.advance(Duration::minutes(3));
        let job = store
            .update_status(id, JobStatus::Running, Some("epoch 1".into()))
            .await
            .unwrap();

        assert_eq!(job.status_history.len(), 1);
        assert_eq!(job.status_history[0].timestamp, clock.now());
    }

    #[tokio::test]
    async fn compare_and_set_skips_changed_status() {
        let store = MemoryStateStore::new();
        let id = running_job(&store);

        store.update_status(id, JobStatus::Done, None).await.unwrap();
        let applied = store
            .compare_and_set_status(id, JobStatus::Running, JobStatus::Error, None)
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn complete_trial_sets_status_and_metric_together() {
        let store = MemoryStateStore::new();
        let id = running_job(&store);

        store.inject_faults(id, 1);
        assert!(store
            .complete_trial(id, JobStatus::Running, 0.8)
            .await
            .unwrap_err()
            .is_transient());
        let untouched = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Running);
        assert_eq!(untouched.metric, None);

        assert!(!store.complete_trial(id, JobStatus::Pending, 0.8).await.unwrap());
        assert!(store.complete_trial(id, JobStatus::Running, 0.8).await.unwrap());
        let done = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.metric, Some(0.8));
    }

    #[tokio::test]
    async fn active_jobs_exclude_terminal() {
        let store = MemoryStateStore::new();
        let running = running_job(&store);
        let done = running_job(&store);
        store.update_status(done, JobStatus::Done, None).await.unwrap();

        let active = store.list_active_jobs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running);
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_run_out() {
        let store = MemoryStateStore::new();
        let id = running_job(&store);
        store.inject_faults(id, 2);

        assert!(store.get_job(id).await.unwrap_err().is_transient());
        assert!(store.get_job(id).await.unwrap_err().is_transient());
        assert!(store.get_job(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_history() {
        let store = MemoryStateStore::new();
        let id = running_job(&store);
        store
            .update_status(id, JobStatus::Running, Some("step 10".into()))
            .await
            .unwrap();

        let json = store.to_json().unwrap();
        let restored = MemoryStateStore::from_json(&json, Arc::new(SystemClock)).unwrap();
        let job = restored.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status_history.len(), 1);
        assert_eq!(job.status_history[0].message.as_deref(), Some("step 10"));
    }

    #[tokio::test]
    async fn compute_manager_scripts_delete_outcomes() {
        let compute = MemoryComputeManager::new();
        let ok = JobId::new_v4();
        let failing = JobId::new_v4();
        let missing = JobId::new_v4();
        compute.fail_deletes_for(failing);
        compute.report_missing_for(missing);

        assert!(compute.delete(ok).await.unwrap());
        assert!(compute.delete(failing).await.is_err());
        assert!(!compute.delete(missing).await.unwrap());
        assert_eq!(compute.deleted(), vec![ok]);
    }

    #[tokio::test]
    async fn unknown_schema_target_is_configuration_error() {
        let provider = StaticSchemaProvider::new()
            .with_target("classifier", vec![ParameterSpec::float("lr", 0.0, 1.0)]);
        assert_eq!(provider.get_param_specs("classifier").await.unwrap().len(), 1);
        assert!(matches!(
            provider.get_param_specs("detector").await,
            Err(HwError::Configuration(_))
        ));
    }
}
