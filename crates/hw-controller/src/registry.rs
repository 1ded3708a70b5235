//! One controller per experiment, each behind its own async mutex so
//! recommendations and observations for an experiment are applied one at a
//! time while different experiments proceed independently.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use hw_monitor::TrialFailureSink;
use hw_optimizer::AlgorithmSettings;
use hw_store::with_backoff;
use hw_types::{
    ErrorCause, ExperimentId, ExperimentRecord, ExperimentSummary, HwError, HwResult, JobId,
    JobRecord,
};

use crate::controller::{ControllerContext, ExperimentController};
use crate::events::TrialEvent;

pub type SharedController = Arc<Mutex<ExperimentController>>;

pub struct ControllerRegistry {
    ctx: ControllerContext,
    controllers: DashMap<ExperimentId, SharedController>,
}

impl ControllerRegistry {
    pub fn new(ctx: ControllerContext) -> Self {
        Self {
            ctx,
            controllers: DashMap::new(),
        }
    }

    /// Persist a new experiment and start it.
    pub async fn create_experiment(
        &self,
        record: ExperimentRecord,
        settings: Option<AlgorithmSettings>,
    ) -> HwResult<SharedController> {
        let id = record.id;
        let store = &self.ctx.store;
        with_backoff(&self.ctx.retry, "put_experiment", || {
            store.put_experiment(record.clone())
        })
        .await?;
        info!(experiment_id = %id, name = %record.name, algorithm = %record.algorithm_kind, "experiment created");
        self.open(id, settings).await
    }

    /// Start (or re-attach to) a persisted experiment. Opening an experiment
    /// that is already registered returns the existing controller.
    pub async fn open(
        &self,
        experiment_id: ExperimentId,
        settings: Option<AlgorithmSettings>,
    ) -> HwResult<SharedController> {
        if let Some(existing) = self.get(experiment_id) {
            return Ok(existing);
        }
        let mut controller = ExperimentController::new(experiment_id, self.ctx.clone());
        if let Some(settings) = settings {
            controller = controller.with_settings(settings);
        }
        controller.start().await?;

        let shared = Arc::new(Mutex::new(controller));
        self.controllers.insert(experiment_id, shared.clone());
        Ok(shared)
    }

    /// Re-open every unfinished experiment in the store, e.g. after a
    /// restart. Returns how many were opened.
    pub async fn restore_all(&self) -> HwResult<usize> {
        let store = &self.ctx.store;
        let experiments =
            with_backoff(&self.ctx.retry, "list_experiments", || store.list_experiments()).await?;

        let mut opened = 0;
        for record in experiments.iter().filter(|e| !e.status.is_terminal()) {
            match self.open(record.id, None).await {
                Ok(_) => opened += 1,
                Err(e) => error!(experiment_id = %record.id, error = %e, "failed to restore experiment"),
            }
        }
        info!(opened, "experiments restored");
        Ok(opened)
    }

    pub fn get(&self, experiment_id: ExperimentId) -> Option<SharedController> {
        self.controllers.get(&experiment_id).map(|c| c.clone())
    }

    pub fn remove(&self, experiment_id: ExperimentId) -> Option<SharedController> {
        self.controllers.remove(&experiment_id).map(|(_, c)| c)
    }

    pub fn experiment_ids(&self) -> Vec<ExperimentId> {
        self.controllers.iter().map(|entry| *entry.key()).collect()
    }

    fn controller(&self, experiment_id: ExperimentId) -> HwResult<SharedController> {
        self.get(experiment_id)
            .ok_or_else(|| HwError::NotFound(format!("no controller for experiment {experiment_id}")))
    }

    /// Experiment a trial belongs to, looked up in the store.
    async fn experiment_of(&self, trial_id: JobId) -> HwResult<ExperimentId> {
        let store = &self.ctx.store;
        with_backoff(&self.ctx.retry, "get_job", || store.get_job(trial_id))
            .await?
            .and_then(|job| job.experiment_id())
            .ok_or_else(|| HwError::NotFound(format!("trial {trial_id}")))
    }

    // ---- Serialized operations ----

    pub async fn recommend_next(&self, experiment_id: ExperimentId) -> HwResult<Vec<JobRecord>> {
        let controller = self.controller(experiment_id)?;
        let mut guard = controller.lock().await;
        guard.recommend_next().await
    }

    pub async fn observe_trial(&self, trial_id: JobId, metric: f64) -> HwResult<()> {
        let controller = self.controller(self.experiment_of(trial_id).await?)?;
        let mut guard = controller.lock().await;
        guard.observe_trial(trial_id, metric).await
    }

    pub async fn fail_trial(&self, trial_id: JobId, cause: ErrorCause) -> HwResult<()> {
        let controller = self.controller(self.experiment_of(trial_id).await?)?;
        let mut guard = controller.lock().await;
        guard.fail_trial(trial_id, cause).await
    }

    pub async fn cancel_trial(&self, trial_id: JobId) -> HwResult<bool> {
        let controller = self.controller(self.experiment_of(trial_id).await?)?;
        let mut guard = controller.lock().await;
        guard.cancel_trial(trial_id).await
    }

    pub async fn pause(&self, experiment_id: ExperimentId) -> HwResult<()> {
        self.controller(experiment_id)?.lock().await.pause().await
    }

    pub async fn resume(&self, experiment_id: ExperimentId) -> HwResult<()> {
        self.controller(experiment_id)?.lock().await.resume().await
    }

    pub async fn request_early_stop(&self, experiment_id: ExperimentId) -> HwResult<()> {
        self.controller(experiment_id)?
            .lock()
            .await
            .request_early_stop()
            .await
    }

    pub async fn summary(&self, experiment_id: ExperimentId) -> HwResult<ExperimentSummary> {
        self.controller(experiment_id)?.lock().await.summary().await
    }

    /// Apply events for one experiment until it finishes or the channel
    /// closes. The lock is taken per event, so other callers interleave.
    pub async fn drive(
        &self,
        experiment_id: ExperimentId,
        mut events: mpsc::Receiver<TrialEvent>,
    ) -> HwResult<ExperimentSummary> {
        let controller = self.controller(experiment_id)?;
        if !controller.lock().await.is_finished().await? {
            while let Some(event) = events.recv().await {
                if controller.lock().await.process(event).await? {
                    break;
                }
            }
        }
        let summary = controller.lock().await.summary().await;
        summary
    }
}

#[async_trait]
impl TrialFailureSink for ControllerRegistry {
    async fn trial_failed(&self, trial: &JobRecord, cause: &ErrorCause) -> HwResult<()> {
        let Some(experiment_id) = trial.experiment_id() else {
            return Ok(());
        };
        let Some(controller) = self.get(experiment_id) else {
            // Picked up from the store when the experiment is next opened.
            debug!(trial_id = %trial.id, %experiment_id, "no controller for timed-out trial");
            return Ok(());
        };
        let mut guard = controller.lock().await;
        guard.fail_trial(trial.id, cause.clone()).await
    }
}
