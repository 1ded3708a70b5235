//! Timeout scanner: periodic sweep that reclaims jobs which stopped reporting.
//!
//! A job counts as timed out when it is Pending or Running and its latest
//! status report (or, without any, its last modification) is older than the
//! configured threshold. Timed-out jobs are forced into Error, their compute
//! workload is deleted, and trials are handed to a [`TrialFailureSink`] so the
//! owning experiment observes the failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hw_store::{with_backoff, Clock, ComputeResourceManager, RetryPolicy, StateStore};
use hw_types::{ErrorCause, HwError, HwResult, JobId, JobRecord, JobStatus};

use crate::config::MonitorConfig;
use crate::events::{TimeoutEvent, TimeoutEventKind};

/// Receives trials the scanner terminated so their experiment can fold the
/// failure into its search.
#[async_trait]
pub trait TrialFailureSink: Send + Sync {
    async fn trial_failed(&self, trial: &JobRecord, cause: &ErrorCause) -> HwResult<()>;
}

/// `true` if `job` is active and has been silent for longer than `threshold`.
pub fn is_timed_out(job: &JobRecord, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    job.status.is_active() && now - job.last_activity() > threshold
}

/// Periodic zombie-job scanner.
pub struct TimeoutScanner {
    store: Arc<dyn StateStore>,
    compute: Arc<dyn ComputeResourceManager>,
    clock: Arc<dyn Clock>,
    config: watch::Receiver<MonitorConfig>,
    sink: Option<Arc<dyn TrialFailureSink>>,
    events: Option<Sender<TimeoutEvent>>,
    retry: RetryPolicy,
}

impl TimeoutScanner {
    pub fn new(
        store: Arc<dyn StateStore>,
        compute: Arc<dyn ComputeResourceManager>,
        clock: Arc<dyn Clock>,
        config: watch::Receiver<MonitorConfig>,
    ) -> Self {
        Self {
            store,
            compute,
            clock,
            config,
            sink: None,
            events: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn TrialFailureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Publish a [`TimeoutEvent`] for every termination.
    pub fn with_events(mut self, events: Sender<TimeoutEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn config(&self) -> MonitorConfig {
        self.config.borrow().clone()
    }

    /// Staleness check against the current clock and threshold.
    pub fn check_job_timeout(&self, job: &JobRecord) -> bool {
        is_timed_out(job, self.clock.now(), self.config().threshold())
    }

    /// Force a timed-out job into Error and reclaim its workload.
    ///
    /// The job is re-read first; if it reached a terminal status or reported
    /// since the scan, nothing is written and `Ok(false)` is returned. The
    /// status write is a compare-and-set against the status just read, so a
    /// concurrent completion always wins.
    pub async fn terminate_timed_out_job(&self, job_id: JobId) -> HwResult<bool> {
        let job = with_backoff(&self.retry, "get_job", || self.store.get_job(job_id))
            .await?
            .ok_or_else(|| HwError::NotFound(format!("job {job_id}")))?;

        if job.status.is_terminal() {
            debug!(%job_id, status = %job.status, "job already finished, not terminating");
            return Ok(false);
        }
        let now = self.clock.now();
        let threshold = self.config().threshold();
        if !is_timed_out(&job, now, threshold) {
            debug!(%job_id, "job reported since the scan, not terminating");
            return Ok(false);
        }

        let elapsed_seconds = (now - job.last_activity()).num_seconds();
        let threshold_seconds = threshold.num_seconds();
        let cause = ErrorCause::Timeout {
            elapsed_seconds,
            threshold_seconds,
        };
        let message = cause.to_string();
        let swapped = with_backoff(&self.retry, "compare_and_set_status", || {
            self.store
                .compare_and_set_status(job_id, job.status, JobStatus::Error, Some(message.clone()))
        })
        .await?;
        if !swapped {
            info!(%job_id, "job status changed concurrently, not terminating");
            return Ok(false);
        }
        warn!(%job_id, experiment_id = ?job.experiment_id(), %message, "terminated timed-out job");

        let cleanup_failure = match self.compute.delete(job_id).await {
            Ok(true) => None,
            Ok(false) => Some("compute manager could not find the workload".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = &cleanup_failure {
            error!(%job_id, %reason, "failed to delete compute resources of timed-out job");
            let note = format!("{message}; {}", ErrorCause::ResourceCleanup(reason.clone()));
            if let Err(e) = with_backoff(&self.retry, "update_status", || {
                self.store
                    .update_status(job_id, JobStatus::Error, Some(note.clone()))
            })
            .await
            {
                warn!(%job_id, error = %e, "could not record cleanup failure");
            }
        }

        if job.is_trial() {
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.trial_failed(&job, &cause).await {
                    error!(%job_id, error = %e, "failed to report timed-out trial to its experiment");
                }
            }
        }

        let kind = match cleanup_failure {
            Some(reason) => TimeoutEventKind::CleanupFailed { reason },
            None => TimeoutEventKind::Terminated,
        };
        self.emit(TimeoutEvent::new(
            now,
            job_id,
            job.experiment_id(),
            elapsed_seconds,
            threshold_seconds,
            kind,
            message,
        ));
        Ok(true)
    }

    /// One scan pass. Returns the ids of the jobs terminated. Failures on a
    /// single job are logged and do not stop the pass.
    pub async fn check_for_timed_out_jobs(&self) -> HwResult<Vec<JobId>> {
        let config = self.config();
        if !config.timeout_monitoring_enabled {
            debug!("timeout monitoring disabled, skipping scan");
            return Ok(Vec::new());
        }

        let jobs = with_backoff(&self.retry, "list_active_jobs", || {
            self.store.list_active_jobs()
        })
        .await?;

        let mut terminated = Vec::new();
        for job in jobs.iter().filter(|job| self.check_job_timeout(job)) {
            match self.terminate_timed_out_job(job.id).await {
                Ok(true) => terminated.push(job.id),
                Ok(false) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "failed to process timed-out job"),
            }
        }

        if !terminated.is_empty() {
            info!(
                scanned = jobs.len(),
                terminated = terminated.len(),
                "timeout scan complete"
            );
        }
        Ok(terminated)
    }

    /// Restart the staleness timer of one job, e.g. after it is resumed.
    pub async fn reset_job_timer(&self, job_id: JobId) -> HwResult<()> {
        with_backoff(&self.retry, "clear_history", || self.store.clear_history(job_id)).await?;
        info!(%job_id, "job timeout timer reset");
        Ok(())
    }

    /// Reset the timer of every Running job. Called when the monitor starts so
    /// downtime of the monitor itself does not count against jobs.
    pub async fn reattach(&self) -> HwResult<usize> {
        let jobs = with_backoff(&self.retry, "list_active_jobs", || {
            self.store.list_active_jobs()
        })
        .await?;

        let mut reset = 0;
        for job in jobs.iter().filter(|job| job.status == JobStatus::Running) {
            match self.reset_job_timer(job.id).await {
                Ok(()) => reset += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to reset job timer"),
            }
        }
        info!(reset, "timeout scanner re-attached to running jobs");
        Ok(reset)
    }

    /// Scan every poll interval until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("timeout scanner started");
        if let Err(e) = self.reattach().await {
            warn!(error = %e, "could not re-attach to running jobs");
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let period = self.config().poll_interval();
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.check_for_timed_out_jobs().await {
                        error!(error = %e, "timeout scan failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("timeout scanner stopped");
    }

    fn emit(&self, event: TimeoutEvent) {
        if let Some(tx) = &self.events {
            // Best-effort send; a dropped receiver only loses the event.
            let _ = tx.try_send(event);
        }
    }
}
