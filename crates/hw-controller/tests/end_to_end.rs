//! Controllers, the timeout scanner and the in-memory collaborators wired
//! together the way the service runs them.

use chrono::Duration;
use std::sync::Arc;
use tokio::sync::mpsc;

use hw_controller::{ControllerContext, ControllerRegistry, ExperimentController, TrialEvent};
use hw_monitor::{MonitorConfig, MonitorHandle, TimeoutScanner};
use hw_optimizer::{AlgorithmSettings, BayesianSettings, HyperBandSettings};
use hw_store::{
    Clock, ManualClock, MemoryComputeManager, MemoryStateStore, RetryPolicy, StateStore,
    StaticSchemaProvider,
};
use hw_types::{
    AlgorithmKind, Comparator, ErrorCause, ExperimentRecord, ExperimentStatus, JobRecord,
    JobStatus, ParameterSpec,
};

struct World {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStateStore>,
    compute: Arc<MemoryComputeManager>,
    ctx: ControllerContext,
}

fn world() -> World {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStateStore::with_clock(clock.clone()));
    let compute = Arc::new(MemoryComputeManager::new());
    let schema = Arc::new(StaticSchemaProvider::new().with_target(
        "convnet",
        vec![
            ParameterSpec::float("learning_rate", 1e-5, 1e-1),
            ParameterSpec::int("filters", 8, 128),
            ParameterSpec::int("kernel", 1, 64).with_dependency(Comparator::Lt, "filters"),
        ],
    ));
    let ctx = ControllerContext::new(store.clone(), compute.clone(), schema, clock.clone())
        .with_retry(RetryPolicy::none());
    World {
        clock,
        store,
        compute,
        ctx,
    }
}

fn experiment(w: &World, name: &str, kind: AlgorithmKind) -> ExperimentRecord {
    ExperimentRecord::new(name, "convnet", kind, w.clock.now())
}

fn bayesian(seed: u64) -> Option<AlgorithmSettings> {
    Some(AlgorithmSettings::Bayesian(BayesianSettings {
        seed: Some(seed),
        ..BayesianSettings::default()
    }))
}

async fn open_trials(store: &MemoryStateStore, record: &ExperimentRecord) -> Vec<JobRecord> {
    store
        .list_trials(record.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| !t.status.is_terminal())
        .collect()
}

#[tokio::test]
async fn timed_out_trial_is_observed_as_failure() {
    let w = world();
    let registry = Arc::new(ControllerRegistry::new(w.ctx.clone()));
    let record = experiment(&w, "zombies", AlgorithmKind::Bayesian)
        .with_max_trials(4)
        .with_concurrency(2);
    registry
        .create_experiment(record.clone(), bayesian(1))
        .await
        .unwrap();

    let (_handle, config) = MonitorHandle::new(MonitorConfig::default());
    let scanner = TimeoutScanner::new(w.store.clone(), w.compute.clone(), w.clock.clone(), config)
        .with_retry(RetryPolicy::none())
        .with_failure_sink(registry.clone());

    let trials = open_trials(&w.store, &record).await;
    assert_eq!(trials.len(), 2);
    let (zombie, healthy) = (&trials[0], &trials[1]);

    w.clock.advance(Duration::minutes(10));
    w.store
        .update_status(healthy.id, JobStatus::Running, None)
        .await
        .unwrap();
    w.clock.advance(Duration::minutes(10));

    let terminated = scanner.check_for_timed_out_jobs().await.unwrap();
    assert_eq!(terminated, vec![zombie.id]);
    assert!(w.compute.deleted().contains(&zombie.id));

    let stored = w.store.get_job(zombie.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Error);
    assert!(stored.message.unwrap().contains("timeout"));

    // The failure freed a slot, so a replacement trial was launched.
    let open = open_trials(&w.store, &record).await;
    assert_eq!(open.len(), 2);
    assert!(open.iter().any(|t| t.id == healthy.id));
    assert!(open.iter().all(|t| t.id != zombie.id));

    let summary = registry.summary(record.id).await.unwrap();
    assert_eq!(summary.trials_failed, 1);
}

#[tokio::test]
async fn timeout_racing_a_completion_does_not_end_hyperband_early() {
    let w = world();
    let registry = ControllerRegistry::new(w.ctx.clone());
    let record = experiment(&w, "race", AlgorithmKind::HyperBand)
        .with_max_trials(100)
        .with_concurrency(9);
    let settings = Some(AlgorithmSettings::HyperBand(HyperBandSettings {
        max_resource: 9,
        reduction_factor: 3,
        parallelism: None,
        seed: Some(21),
    }));
    registry
        .create_experiment(record.clone(), settings)
        .await
        .unwrap();

    let rung0 = open_trials(&w.store, &record).await;
    assert_eq!(rung0.len(), 9);
    for (i, trial) in rung0.iter().enumerate().take(7) {
        registry.observe_trial(trial.id, i as f64).await.unwrap();
    }

    // The scanner has marked the last trial as failed but its report has
    // not reached the controller when the other trial completes.
    let zombie = &rung0[8];
    assert!(w
        .store
        .compare_and_set_status(zombie.id, JobStatus::Pending, JobStatus::Error, None)
        .await
        .unwrap());
    registry.observe_trial(rung0[7].id, 7.0).await.unwrap();

    let summary = registry.summary(record.id).await.unwrap();
    assert_eq!(summary.status, ExperimentStatus::Searching);
    let rung1 = open_trials(&w.store, &record).await;
    assert_eq!(rung1.len(), 3);
    assert!(rung1.iter().all(|t| t.rung == Some(1)));

    // The report arriving afterwards is absorbed without a second observation.
    let cause = ErrorCause::Timeout {
        elapsed_seconds: 1200,
        threshold_seconds: 900,
    };
    registry.fail_trial(zombie.id, cause).await.unwrap();
    let summary = registry.summary(record.id).await.unwrap();
    assert_eq!(summary.status, ExperimentStatus::Searching);
    assert_eq!(summary.trials_failed, 1);
    assert_eq!(open_trials(&w.store, &record).await.len(), 3);
}

#[tokio::test]
async fn restart_rebuilds_search_from_store() {
    let w = world();
    let record = experiment(&w, "restart", AlgorithmKind::HyperBand)
        .with_max_trials(40)
        .with_concurrency(9);
    let settings = Some(AlgorithmSettings::HyperBand(HyperBandSettings {
        max_resource: 9,
        reduction_factor: 3,
        parallelism: None,
        seed: Some(5),
    }));

    {
        let registry = ControllerRegistry::new(w.ctx.clone());
        registry
            .create_experiment(record.clone(), settings.clone())
            .await
            .unwrap();
        let rung0 = open_trials(&w.store, &record).await;
        assert_eq!(rung0.len(), 9);
        for (i, trial) in rung0.iter().enumerate().take(5) {
            registry.observe_trial(trial.id, i as f64).await.unwrap();
        }
    }

    // Process restart: a new registry with no in-memory state.
    let registry = ControllerRegistry::new(w.ctx.clone());
    registry.open(record.id, settings).await.unwrap();

    let remaining = open_trials(&w.store, &record).await;
    assert_eq!(remaining.len(), 4);
    for (i, trial) in remaining.iter().enumerate() {
        registry
            .observe_trial(trial.id, 5.0 + i as f64)
            .await
            .unwrap();
    }

    // Rung 0 completed after the restart; the top three move up a rung.
    let rung1 = open_trials(&w.store, &record).await;
    assert_eq!(rung1.len(), 3);
    assert!(rung1.iter().all(|t| t.rung == Some(1)));
    assert!(rung1.iter().all(|t| t.trial_number().unwrap() >= 9));
}

#[tokio::test]
async fn restore_all_skips_finished_experiments() {
    let w = world();
    let mut done = experiment(&w, "done", AlgorithmKind::Bayesian);
    done.mark_done(w.clock.now());
    let pending = experiment(&w, "pending", AlgorithmKind::Bayesian)
        .with_max_trials(3)
        .with_concurrency(1);
    w.store.put_experiment(done).await.unwrap();
    w.store.put_experiment(pending.clone()).await.unwrap();

    let registry = ControllerRegistry::new(w.ctx.clone());
    assert_eq!(registry.restore_all().await.unwrap(), 1);
    assert_eq!(registry.experiment_ids(), vec![pending.id]);
    assert_eq!(open_trials(&w.store, &pending).await.len(), 1);
}

#[tokio::test]
async fn event_loop_runs_experiment_to_completion() {
    let w = world();
    let record = experiment(&w, "loop", AlgorithmKind::Bayesian)
        .with_max_trials(5)
        .with_concurrency(2);
    w.store.put_experiment(record.clone()).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    let mut controller = ExperimentController::new(record.id, w.ctx.clone()).with_settings(
        AlgorithmSettings::Bayesian(BayesianSettings {
            seed: Some(9),
            ..BayesianSettings::default()
        }),
    );
    let store = w.store.clone();
    let worker = {
        let record = record.clone();
        tokio::spawn(async move {
            // Acts as the training workers: report every open trial.
            let mut metric = 0.0;
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                let open = open_trials(&store, &record).await;
                if open.is_empty() {
                    let done = store
                        .get_experiment(record.id)
                        .await
                        .unwrap()
                        .is_some_and(|e| e.status.is_terminal());
                    if done {
                        break;
                    }
                    continue;
                }
                for trial in open {
                    metric += 0.1;
                    if tx
                        .send(TrialEvent::Completed {
                            trial_id: trial.id,
                            metric,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        })
    };

    let summary = controller.run(rx).await.unwrap();
    worker.await.unwrap();
    assert_eq!(summary.status, ExperimentStatus::Done);
    assert_eq!(summary.trials_completed, 5);
    assert!(summary.best_trial_id.is_some());
}

#[tokio::test]
async fn registry_drive_applies_pause_and_early_stop() {
    let w = world();
    let registry = ControllerRegistry::new(w.ctx.clone());
    let record = experiment(&w, "drive", AlgorithmKind::Bayesian)
        .with_max_trials(20)
        .with_concurrency(2);
    registry
        .create_experiment(record.clone(), bayesian(4))
        .await
        .unwrap();

    let first = open_trials(&w.store, &record).await.remove(0);
    let (tx, rx) = mpsc::channel(8);
    tx.send(TrialEvent::Completed {
        trial_id: first.id,
        metric: 0.42,
    })
    .await
    .unwrap();
    tx.send(TrialEvent::Pause).await.unwrap();
    tx.send(TrialEvent::EarlyStop).await.unwrap();
    drop(tx);

    let summary = registry.drive(record.id, rx).await.unwrap();
    assert_eq!(summary.status, ExperimentStatus::Done);
    assert_eq!(summary.best_trial_id, Some(first.id));
    assert_eq!(summary.best_metric, Some(0.42));
    assert_eq!(summary.trials_canceled, 2);
}

#[tokio::test]
async fn dependent_parameters_respect_parent_values() {
    let w = world();
    let registry = ControllerRegistry::new(w.ctx.clone());
    let record = experiment(&w, "deps", AlgorithmKind::Bayesian)
        .with_max_trials(12)
        .with_concurrency(12);
    registry
        .create_experiment(record.clone(), bayesian(8))
        .await
        .unwrap();

    let trials = open_trials(&w.store, &record).await;
    assert_eq!(trials.len(), 12);
    for trial in trials {
        let assignment = trial.parameter_assignment.unwrap();
        let filters = assignment["filters"].as_i64().unwrap();
        let kernel = assignment["kernel"].as_i64().unwrap();
        assert!(kernel < filters, "kernel {kernel} >= filters {filters}");
    }
}
