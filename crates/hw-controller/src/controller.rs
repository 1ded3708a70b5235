//! Experiment controller: the per-experiment state machine
//! `Initializing -> Searching -> Finalizing -> Done`, with `Error` reachable
//! from any non-terminal state.
//!
//! Everything the controller needs to continue after a restart lives in the
//! state store. The in-memory search algorithm is rebuilt from the persisted
//! trials on every start and resume.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use hw_optimizer::{
    build_algorithm, AlgorithmSettings, ExperimentSpec, Recommendation, SearchAlgorithm,
    TrialOutcome, TrialResult,
};
use hw_store::{with_backoff, Clock, ComputeResourceManager, RetryPolicy, SchemaProvider, StateStore};
use hw_types::{
    config_error, ErrorCause, ExperimentId, ExperimentRecord, ExperimentStatus, ExperimentSummary,
    HwError, HwResult, JobId, JobRecord, JobStatus, SearchError,
};

use crate::events::{ExperimentEvent, TrialEvent};

/// Collaborators shared by every controller.
#[derive(Clone)]
pub struct ControllerContext {
    pub store: Arc<dyn StateStore>,
    pub compute: Arc<dyn ComputeResourceManager>,
    pub schema: Arc<dyn SchemaProvider>,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryPolicy,
}

impl ControllerContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        compute: Arc<dyn ComputeResourceManager>,
        schema: Arc<dyn SchemaProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            compute,
            schema,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Tally of an experiment's persisted trials.
#[derive(Debug, Default)]
struct TrialCounts {
    launched: usize,
    /// Trials not yet in a terminal status.
    outstanding: Vec<JobId>,
    /// Resource units granted so far. Trials without a resource count as one.
    resource_used: f64,
    completed: usize,
    failed: usize,
    canceled: usize,
}

impl TrialCounts {
    fn from_trials(trials: &[JobRecord]) -> Self {
        let mut counts = Self {
            launched: trials.len(),
            ..Self::default()
        };
        for trial in trials {
            counts.resource_used += trial.resource.unwrap_or(1.0);
            match trial.status {
                JobStatus::Done if trial.metric.is_some_and(f64::is_finite) => counts.completed += 1,
                JobStatus::Done | JobStatus::Error => counts.failed += 1,
                JobStatus::Canceled => counts.canceled += 1,
                _ => counts.outstanding.push(trial.id),
            }
        }
        counts
    }

    fn budget_exhausted(&self, record: &ExperimentRecord) -> bool {
        self.launched >= record.budget.max_trials
            || record
                .budget
                .max_resource_units
                .is_some_and(|max| self.resource_used >= max)
    }
}

/// Drives one experiment. Not internally synchronized: callers serialize
/// access, normally through [`ControllerRegistry`](crate::ControllerRegistry).
pub struct ExperimentController {
    experiment_id: ExperimentId,
    ctx: ControllerContext,
    /// Explicit algorithm settings; defaults for the record's kind otherwise.
    settings: Option<AlgorithmSettings>,
    algorithm: Option<Box<dyn SearchAlgorithm>>,
    /// Trials already folded into the algorithm.
    observed: HashSet<JobId>,
    events: Vec<ExperimentEvent>,
}

impl ExperimentController {
    pub fn new(experiment_id: ExperimentId, ctx: ControllerContext) -> Self {
        Self {
            experiment_id,
            ctx,
            settings: None,
            algorithm: None,
            observed: HashSet::new(),
            events: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: AlgorithmSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn experiment_id(&self) -> ExperimentId {
        self.experiment_id
    }

    /// Drain the events emitted since the last call.
    pub fn take_events(&mut self) -> Vec<ExperimentEvent> {
        std::mem::take(&mut self.events)
    }

    // ---- Lifecycle ----

    /// Load the schema and custom ranges, rebuild the search from persisted
    /// trials and start issuing trials. Configuration problems move the
    /// experiment to Error.
    pub async fn start(&mut self) -> HwResult<()> {
        let mut record = self.load_experiment().await?;
        match record.status {
            ExperimentStatus::Done | ExperimentStatus::Error => {
                info!(experiment_id = %self.experiment_id, status = ?record.status, "experiment already finished");
                return Ok(());
            }
            ExperimentStatus::Finalizing => return self.finalize("finalization resumed").await,
            ExperimentStatus::Initializing | ExperimentStatus::Searching => {}
        }

        let prepared = match check_limits(&record) {
            Ok(()) => self.rebuild(&record).await,
            Err(e) => Err(e),
        };
        let restored = match prepared {
            Ok(restored) => restored,
            Err(e) if is_configuration_failure(&e) => {
                self.fail(e.to_string()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if record.status == ExperimentStatus::Initializing {
            record.mark_searching();
            self.save_experiment(record.clone()).await?;
        }
        info!(
            experiment_id = %self.experiment_id,
            algorithm = %record.algorithm_kind,
            restored,
            "experiment searching"
        );
        self.emit(ExperimentEvent::Started {
            algorithm: record.algorithm_kind,
            restored_trials: restored,
        });
        self.advance().await
    }

    /// Stop issuing trials. Outstanding trials are paused so the timeout
    /// scanner leaves them alone.
    pub async fn pause(&mut self) -> HwResult<()> {
        let mut record = self.load_experiment().await?;
        if record.status.is_terminal() || record.paused {
            return Ok(());
        }
        record.paused = true;
        self.save_experiment(record).await?;

        for trial_id in self.trial_counts().await?.outstanding {
            let Some(trial) = self.get_trial(trial_id).await? else {
                continue;
            };
            if trial.status.is_active() {
                self.compare_and_set(trial_id, trial.status, JobStatus::Paused, None)
                    .await?;
            }
        }
        info!(experiment_id = %self.experiment_id, "experiment paused");
        self.emit(ExperimentEvent::Paused);
        Ok(())
    }

    /// Resume a paused experiment. Paused trials go back to the status they
    /// were paused from with their status history cleared, and the search is
    /// rebuilt from the store before new trials are issued.
    pub async fn resume(&mut self) -> HwResult<()> {
        let mut record = self.load_experiment().await?;
        if record.status.is_terminal() || !record.paused {
            return Ok(());
        }

        for trial_id in self.trial_counts().await?.outstanding {
            let Some(trial) = self.get_trial(trial_id).await? else {
                continue;
            };
            if trial.status == JobStatus::Paused {
                let previous = trial.paused_from.unwrap_or(JobStatus::Running);
                self.compare_and_set(trial_id, JobStatus::Paused, previous, None)
                    .await?;
            }
            let store = &self.ctx.store;
            with_backoff(&self.ctx.retry, "clear_history", || store.clear_history(trial_id))
                .await?;
        }

        record.paused = false;
        self.save_experiment(record.clone()).await?;
        self.rebuild(&record).await?;
        info!(experiment_id = %self.experiment_id, "experiment resumed");
        self.emit(ExperimentEvent::Resumed);
        self.advance().await
    }

    /// Stop the search: cancel outstanding trials and finalize.
    pub async fn request_early_stop(&mut self) -> HwResult<()> {
        let mut record = self.load_experiment().await?;
        if record.status.is_terminal() {
            return Ok(());
        }
        record.early_stop_requested = true;
        self.save_experiment(record).await?;
        info!(experiment_id = %self.experiment_id, "early stop requested");
        self.advance().await
    }

    pub async fn is_finished(&self) -> HwResult<bool> {
        Ok(self.load_experiment().await?.status.is_terminal())
    }

    // ---- Trials ----

    /// Issue and launch as many trials as the concurrency cap and budget
    /// allow. Returns the created trial records.
    pub async fn recommend_next(&mut self) -> HwResult<Vec<JobRecord>> {
        let record = self.load_experiment().await?;
        if record.status != ExperimentStatus::Searching || record.paused || record.early_stop_requested
        {
            return Ok(Vec::new());
        }
        let counts = self.trial_counts().await?;
        if counts.budget_exhausted(&record) {
            return Ok(Vec::new());
        }
        let capacity = record
            .concurrency_cap
            .saturating_sub(counts.outstanding.len());
        let n = capacity.min(record.budget.max_trials - counts.launched);
        if n == 0 {
            return Ok(Vec::new());
        }

        let recommendations = self.algorithm_mut()?.recommend(n)?;
        let mut resource_used = counts.resource_used;
        let mut launched = Vec::with_capacity(recommendations.len());
        for rec in recommendations {
            let units = rec.resource.unwrap_or(1.0);
            if let Some(max) = record.budget.max_resource_units {
                if resource_used + units > max {
                    debug!(trial_id = %rec.trial_id, units, "resource budget reached, dropping recommendation");
                    self.algorithm_mut()?.cancel(rec.trial_id)?;
                    continue;
                }
            }
            resource_used += units;
            let number = counts.launched + launched.len();
            launched.push(self.launch_trial(rec, number).await?);
        }
        Ok(launched)
    }

    /// Record a trial's final metric and continue the search.
    pub async fn observe_trial(&mut self, trial_id: JobId, metric: f64) -> HwResult<()> {
        let trial = self.load_trial(trial_id).await?;
        if trial.status.is_terminal() {
            warn!(%trial_id, status = %trial.status, "ignoring result for finished trial");
            return Ok(());
        }
        let store = &self.ctx.store;
        let completed = with_backoff(&self.ctx.retry, "complete_trial", || {
            store.complete_trial(trial_id, trial.status, metric)
        })
        .await?;
        if !completed {
            info!(%trial_id, "trial status changed before its result was recorded");
            return self.advance().await;
        }

        let finished = self.load_trial(trial_id).await?;
        self.record_result(&finished).await?;
        self.advance().await
    }

    /// Fail a trial, or fold in a failure another component already wrote
    /// (the timeout scanner sets Error itself before calling this).
    pub async fn fail_trial(&mut self, trial_id: JobId, cause: ErrorCause) -> HwResult<()> {
        let trial = self.load_trial(trial_id).await?;
        match trial.status {
            JobStatus::Done | JobStatus::Canceled => {
                debug!(%trial_id, status = %trial.status, "trial already finished, failure ignored");
                return Ok(());
            }
            JobStatus::Error if self.observed.contains(&trial_id) => {
                debug!(%trial_id, "failure already folded into the search");
                return Ok(());
            }
            JobStatus::Error => {}
            current => {
                let swapped = self
                    .compare_and_set(trial_id, current, JobStatus::Error, Some(cause.to_string()))
                    .await?;
                if !swapped && self.load_trial(trial_id).await?.status != JobStatus::Error {
                    info!(%trial_id, "trial status changed before its failure was recorded");
                    return Ok(());
                }
            }
        }
        warn!(%trial_id, experiment_id = %self.experiment_id, %cause, "trial failed");

        let failed = self.load_trial(trial_id).await?;
        self.record_result(&failed).await?;
        self.advance().await
    }

    /// Cancel an outstanding trial. Canceled trials are never observed or
    /// promoted. Returns `false` if the trial had already finished.
    pub async fn cancel_trial(&mut self, trial_id: JobId) -> HwResult<bool> {
        let canceled = self.cancel_outstanding(trial_id).await?;
        if canceled {
            self.advance().await?;
        }
        Ok(canceled)
    }

    // ---- Results ----

    /// Summary computed from the persisted trials.
    pub async fn summary(&self) -> HwResult<ExperimentSummary> {
        let record = self.load_experiment().await?;
        let trials = self.list_trials().await?;
        let counts = TrialCounts::from_trials(&trials);
        let best = best_trial(&record, &trials);
        Ok(ExperimentSummary {
            experiment_id: self.experiment_id,
            status: record.status,
            best_trial_id: best.map(|t| t.id),
            best_metric: best.and_then(|t| t.metric),
            best_assignment: best.and_then(|t| t.parameter_assignment.clone()),
            trials_completed: counts.completed,
            trials_failed: counts.failed,
            trials_canceled: counts.canceled,
        })
    }

    // ---- Event loop ----

    /// Apply one event. Returns `true` once the experiment is finished.
    /// Transient and per-trial errors are logged; anything else fails the
    /// experiment.
    pub async fn process(&mut self, event: TrialEvent) -> HwResult<bool> {
        let result = match event {
            TrialEvent::Completed { trial_id, metric } => self.observe_trial(trial_id, metric).await,
            TrialEvent::Failed { trial_id, cause } => self.fail_trial(trial_id, cause).await,
            TrialEvent::Cancel { trial_id } => self.cancel_trial(trial_id).await.map(|_| ()),
            TrialEvent::Pause => self.pause().await,
            TrialEvent::Resume => self.resume().await,
            TrialEvent::EarlyStop => self.request_early_stop().await,
        };
        match result {
            Ok(()) => {}
            Err(e) if is_recoverable(&e) => {
                warn!(experiment_id = %self.experiment_id, error = %e, "event could not be applied");
            }
            Err(e) => {
                error!(experiment_id = %self.experiment_id, error = %e, "experiment failed");
                self.fail(e.to_string()).await?;
                return Err(e);
            }
        }
        self.is_finished().await
    }

    /// Start the experiment and apply events until it finishes or the
    /// channel closes.
    pub async fn run(&mut self, mut events: mpsc::Receiver<TrialEvent>) -> HwResult<ExperimentSummary> {
        self.start().await?;
        while !self.is_finished().await? {
            let Some(event) = events.recv().await else {
                info!(experiment_id = %self.experiment_id, "event channel closed");
                break;
            };
            if self.process(event).await? {
                break;
            }
        }
        self.summary().await
    }

    // ---- Internals ----

    /// Re-create the search algorithm and replay every persisted trial in
    /// trial-number order. Returns the number of trials replayed.
    async fn rebuild(&mut self, record: &ExperimentRecord) -> HwResult<usize> {
        let settings = match &self.settings {
            Some(settings) if settings.kind() != record.algorithm_kind => {
                return Err(config_error!(
                    "experiment {} uses {} but the controller was configured for {}",
                    record.id,
                    record.algorithm_kind,
                    settings.kind()
                ));
            }
            Some(settings) => settings.clone(),
            None => AlgorithmSettings::for_kind(record.algorithm_kind),
        };

        let schema = self.ctx.schema.get_param_specs(&record.target).await?;
        let store = &self.ctx.store;
        let ranges = with_backoff(&self.ctx.retry, "get_custom_ranges", || {
            store.get_custom_ranges(record.id)
        })
        .await?;
        let spec = ExperimentSpec::for_record(record, schema);

        let mut algorithm = build_algorithm(&settings);
        algorithm.initialize(&spec, &ranges)?;

        let trials = self.list_trials().await?;
        let mut observed = HashSet::new();
        for trial in &trials {
            let Some(rec) = Recommendation::from_record(trial) else {
                warn!(trial_id = %trial.id, "trial without parameter assignment skipped");
                continue;
            };
            if let Err(e) = algorithm.restore(&rec) {
                warn!(trial_id = %trial.id, error = %e, "trial could not be restored into the search");
                continue;
            }
            if trial.status == JobStatus::Canceled {
                algorithm.cancel(trial.id)?;
                observed.insert(trial.id);
            } else if let Some(result) = TrialResult::from_record(trial) {
                if let Err(e) = algorithm.observe(&result) {
                    warn!(trial_id = %trial.id, error = %e, "persisted result rejected by the search");
                }
                observed.insert(trial.id);
            }
        }

        debug!(
            experiment_id = %record.id,
            trials = trials.len(),
            observed = observed.len(),
            algorithm = algorithm.name(),
            "search rebuilt from persisted trials"
        );
        self.algorithm = Some(algorithm);
        self.observed = observed;
        Ok(trials.len())
    }

    /// Launch more trials and finalize once nothing is outstanding and no
    /// further trial can be issued.
    async fn advance(&mut self) -> HwResult<()> {
        let record = self.load_experiment().await?;
        if record.status != ExperimentStatus::Searching {
            return Ok(());
        }
        self.reconcile().await?;
        if record.early_stop_requested {
            for trial_id in self.trial_counts().await?.outstanding {
                self.cancel_outstanding(trial_id).await?;
            }
            return self.finalize("early stop").await;
        }
        if record.paused {
            return Ok(());
        }

        // Loop because a trial whose launch fails is observed as failed at once.
        let counts = loop {
            let launched = self.recommend_next().await?;
            let counts = self.trial_counts().await?;
            if !counts.outstanding.is_empty() {
                return Ok(());
            }
            if launched.is_empty() {
                break counts;
            }
        };

        let reason = if counts.budget_exhausted(&record) {
            "budget exhausted"
        } else if self.algorithm.as_ref().is_some_and(|a| a.is_exhausted()) {
            "search space exhausted"
        } else {
            "no further recommendations"
        };
        self.finalize(reason).await
    }

    /// Fold in trials that reached a terminal status without passing through
    /// this controller, such as a timeout whose failure report has not
    /// arrived yet.
    async fn reconcile(&mut self) -> HwResult<()> {
        let unseen: Vec<JobRecord> = self
            .list_trials()
            .await?
            .into_iter()
            .filter(|t| t.status.is_terminal() && !self.observed.contains(&t.id))
            .collect();
        for trial in unseen {
            debug!(trial_id = %trial.id, status = %trial.status, "folding in trial finished elsewhere");
            if trial.status == JobStatus::Canceled {
                if let Err(e) = self.algorithm_mut()?.cancel(trial.id) {
                    warn!(trial_id = %trial.id, error = %e, "cancellation rejected by the search");
                }
                self.observed.insert(trial.id);
            } else {
                self.record_result(&trial).await?;
            }
        }
        Ok(())
    }

    async fn finalize(&mut self, reason: &str) -> HwResult<()> {
        let mut record = self.load_experiment().await?;
        record.mark_finalizing();
        self.save_experiment(record.clone()).await?;

        let trials = self.list_trials().await?;
        if let Some(best) = best_trial(&record, &trials) {
            record.best_trial_id = Some(best.id);
            record.best_metric = best.metric;
        }
        record.mark_done(self.ctx.clock.now());
        self.save_experiment(record).await?;

        let summary = self.summary().await?;
        info!(
            experiment_id = %self.experiment_id,
            reason,
            best_trial = ?summary.best_trial_id,
            best_metric = ?summary.best_metric,
            completed = summary.trials_completed,
            failed = summary.trials_failed,
            canceled = summary.trials_canceled,
            "experiment finished"
        );
        self.emit(ExperimentEvent::Finished {
            reason: reason.to_string(),
            summary,
        });
        Ok(())
    }

    async fn fail(&mut self, message: String) -> HwResult<()> {
        let mut record = self.load_experiment().await?;
        if record.status.is_terminal() {
            return Ok(());
        }
        record.mark_failed(message.clone(), self.ctx.clock.now());
        self.save_experiment(record).await?;
        error!(experiment_id = %self.experiment_id, %message, "experiment moved to error");
        self.emit(ExperimentEvent::Failed { message });
        Ok(())
    }

    async fn launch_trial(&mut self, rec: Recommendation, number: usize) -> HwResult<JobRecord> {
        let mut trial =
            JobRecord::new_trial(self.experiment_id, number, rec.assignment, self.ctx.clock.now());
        trial.id = rec.trial_id;
        trial.rung = rec.rung;
        trial.resource = rec.resource;

        let store = self.ctx.store.clone();
        with_backoff(&self.ctx.retry, "put_job", || store.put_job(trial.clone())).await?;
        self.emit(ExperimentEvent::TrialLaunched {
            trial_id: trial.id,
            trial_number: number,
            rung: trial.rung,
        });

        match self.ctx.compute.launch(&trial).await {
            Ok(()) => {
                info!(trial_id = %trial.id, trial_number = number, rung = ?trial.rung, "trial launched");
            }
            Err(e) => {
                error!(trial_id = %trial.id, error = %e, "trial launch failed");
                let cause = ErrorCause::ExplicitFailure(format!("launch failed: {e}"));
                trial.record_status(JobStatus::Error, Some(cause.to_string()), self.ctx.clock.now())?;
                with_backoff(&self.ctx.retry, "put_job", || store.put_job(trial.clone())).await?;
                self.record_result(&trial).await?;
            }
        }
        Ok(trial)
    }

    /// Set an outstanding trial to Canceled and tell the algorithm.
    async fn cancel_outstanding(&mut self, trial_id: JobId) -> HwResult<bool> {
        let trial = self.load_trial(trial_id).await?;
        if trial.status.is_terminal() {
            return Ok(false);
        }
        if !self
            .compare_and_set(trial_id, trial.status, JobStatus::Canceled, None)
            .await?
        {
            return Ok(false);
        }
        match self.ctx.compute.delete(trial_id).await {
            Ok(true) => {}
            Ok(false) => warn!(%trial_id, "no compute resources found for canceled trial"),
            Err(e) => warn!(%trial_id, error = %e, "failed to delete compute resources of canceled trial"),
        }
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.cancel(trial_id)?;
        }
        self.observed.insert(trial_id);
        info!(%trial_id, "trial canceled");
        self.emit(ExperimentEvent::TrialCanceled { trial_id });
        Ok(true)
    }

    /// Fold a terminal trial into the algorithm once and track the best.
    async fn record_result(&mut self, trial: &JobRecord) -> HwResult<()> {
        let Some(result) = TrialResult::from_record(trial) else {
            return Ok(());
        };
        if !self.observed.insert(trial.id) {
            debug!(trial_id = %trial.id, "trial already observed");
            return Ok(());
        }
        match self.algorithm_mut()?.observe(&result) {
            Ok(()) => {}
            Err(HwError::Search(
                e @ (SearchError::InvalidObservation { .. } | SearchError::UnknownTrial { .. }),
            )) => {
                warn!(trial_id = %trial.id, error = %e, "observation rejected by the search");
            }
            Err(e) => return Err(e),
        }

        let metric = match result.outcome {
            TrialOutcome::Completed(metric) if metric.is_finite() => Some(metric),
            _ => None,
        };
        self.emit(ExperimentEvent::TrialObserved {
            trial_id: trial.id,
            metric,
        });
        if let Some(metric) = metric {
            let mut record = self.load_experiment().await?;
            if record.update_best(trial.id, metric) {
                self.save_experiment(record).await?;
                info!(trial_id = %trial.id, metric, "new best trial");
                self.emit(ExperimentEvent::BestImproved {
                    trial_id: trial.id,
                    metric,
                });
            }
        }
        Ok(())
    }

    fn algorithm_mut(&mut self) -> HwResult<&mut Box<dyn SearchAlgorithm>> {
        self.algorithm
            .as_mut()
            .ok_or_else(|| SearchError::NotInitialized.into())
    }

    fn emit(&mut self, event: ExperimentEvent) {
        self.events.push(event);
    }

    // ---- Store access ----

    async fn load_experiment(&self) -> HwResult<ExperimentRecord> {
        let store = &self.ctx.store;
        with_backoff(&self.ctx.retry, "get_experiment", || {
            store.get_experiment(self.experiment_id)
        })
        .await?
        .ok_or_else(|| HwError::NotFound(format!("experiment {}", self.experiment_id)))
    }

    async fn save_experiment(&self, record: ExperimentRecord) -> HwResult<()> {
        let store = &self.ctx.store;
        with_backoff(&self.ctx.retry, "put_experiment", || {
            store.put_experiment(record.clone())
        })
        .await
    }

    async fn list_trials(&self) -> HwResult<Vec<JobRecord>> {
        let store = &self.ctx.store;
        with_backoff(&self.ctx.retry, "list_trials", || {
            store.list_trials(self.experiment_id)
        })
        .await
    }

    async fn trial_counts(&self) -> HwResult<TrialCounts> {
        Ok(TrialCounts::from_trials(&self.list_trials().await?))
    }

    async fn get_trial(&self, trial_id: JobId) -> HwResult<Option<JobRecord>> {
        let store = &self.ctx.store;
        with_backoff(&self.ctx.retry, "get_job", || store.get_job(trial_id)).await
    }

    /// A trial of this experiment; NotFound for unknown ids and for jobs of
    /// other experiments.
    async fn load_trial(&self, trial_id: JobId) -> HwResult<JobRecord> {
        match self.get_trial(trial_id).await? {
            Some(trial) if trial.experiment_id() == Some(self.experiment_id) => Ok(trial),
            _ => Err(HwError::NotFound(format!(
                "trial {trial_id} of experiment {}",
                self.experiment_id
            ))),
        }
    }

    async fn compare_and_set(
        &self,
        trial_id: JobId,
        expected: JobStatus,
        status: JobStatus,
        message: Option<String>,
    ) -> HwResult<bool> {
        let store = &self.ctx.store;
        with_backoff(&self.ctx.retry, "compare_and_set_status", || {
            store.compare_and_set_status(trial_id, expected, status, message.clone())
        })
        .await
    }
}

/// Best completed trial; earlier trials win ties.
fn best_trial<'a>(record: &ExperimentRecord, trials: &'a [JobRecord]) -> Option<&'a JobRecord> {
    trials
        .iter()
        .filter(|t| t.status == JobStatus::Done)
        .filter_map(|t| t.metric.filter(|m| m.is_finite()).map(|m| (t, m)))
        .min_by(|(a, ma), (b, mb)| {
            record
                .direction
                .cmp_best_first(*ma, *mb)
                .then(a.trial_number().cmp(&b.trial_number()))
        })
        .map(|(t, _)| t)
}

fn check_limits(record: &ExperimentRecord) -> HwResult<()> {
    if record.concurrency_cap == 0 {
        return Err(config_error!(
            "experiment {} has a concurrency cap of zero",
            record.id
        ));
    }
    Ok(())
}

fn is_configuration_failure(e: &HwError) -> bool {
    matches!(
        e,
        HwError::Configuration(_) | HwError::DependencyUnresolved { .. } | HwError::Search(_)
    )
}

fn is_recoverable(e: &HwError) -> bool {
    e.is_transient() || matches!(e, HwError::NotFound(_) | HwError::InvalidTransition { .. })
}
