//! HyperWatch service: restores unfinished experiments, creates the
//! configured ones and runs the timeout scanner until interrupted.

mod config;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hw_controller::{ControllerContext, ControllerRegistry};
use hw_monitor::{MonitorHandle, TimeoutEvent, TimeoutEventKind, TimeoutScanner};
use hw_store::{Clock, MemoryComputeManager, MemoryStateStore, StateStore, SystemClock};

use crate::config::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::load()?;
    info!(
        threshold_minutes = config.monitor.timeout_threshold_minutes,
        monitoring = config.monitor.timeout_monitoring_enabled,
        poll_seconds = config.monitor.poll_interval_seconds,
        experiments = config.experiments.len(),
        "HyperWatch service starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(load_store(&config, clock.clone())?);
    let compute = Arc::new(MemoryComputeManager::new());
    let ctx = ControllerContext::new(
        store.clone(),
        compute.clone(),
        Arc::new(config.schema_provider()),
        clock.clone(),
    )
    .with_retry(config.retry.clone());
    let registry = Arc::new(ControllerRegistry::new(ctx));

    registry.restore_all().await?;
    let existing = store.list_experiments().await?;
    for experiment in &config.experiments {
        if existing.iter().any(|e| e.name == experiment.name) {
            info!(name = %experiment.name, "experiment already exists, not re-creating");
            continue;
        }
        let record = experiment.to_record(clock.as_ref());
        store
            .set_custom_ranges(record.id, experiment.custom_ranges.clone())
            .await?;
        if let Err(e) = registry
            .create_experiment(record, Some(experiment.algorithm.clone()))
            .await
        {
            warn!(name = %experiment.name, error = %e, "experiment could not be started");
        }
    }

    let (monitor, monitor_rx) = MonitorHandle::new(config.monitor.clone());
    let (event_tx, event_rx) = crossbeam_channel::unbounded::<TimeoutEvent>();
    let scanner = Arc::new(
        TimeoutScanner::new(store.clone(), compute, clock, monitor_rx)
            .with_retry(config.retry.clone())
            .with_failure_sink(registry.clone())
            .with_events(event_tx),
    );

    let event_log = std::thread::spawn(move || {
        for event in event_rx.iter() {
            match &event.kind {
                TimeoutEventKind::Terminated => {
                    info!(job_id = %event.job_id, experiment_id = ?event.experiment_id, elapsed_seconds = event.elapsed_seconds, "timeout event")
                }
                TimeoutEventKind::CleanupFailed { reason } => {
                    warn!(job_id = %event.job_id, experiment_id = ?event.experiment_id, %reason, "timeout event with cleanup failure")
                }
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scan_task = tokio::spawn({
        let scanner = scanner.clone();
        async move { scanner.run(shutdown_rx).await }
    });
    spawn_config_reload(monitor);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    scan_task.await.context("scanner task panicked")?;
    drop(scanner);
    if event_log.join().is_err() {
        warn!("timeout event logger panicked");
    }

    if let Some(path) = &config.state_file {
        std::fs::write(path, store.to_json()?)
            .with_context(|| format!("failed to write state file {}", path.display()))?;
        info!(path = %path.display(), "state saved");
    }
    info!("HyperWatch service stopped");
    Ok(())
}

fn load_store(config: &ServiceConfig, clock: Arc<dyn Clock>) -> Result<MemoryStateStore> {
    match &config.state_file {
        Some(path) if path.exists() => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read state file {}", path.display()))?;
            let store = MemoryStateStore::from_json(&raw, clock)?;
            info!(path = %path.display(), "state restored");
            Ok(store)
        }
        _ => Ok(MemoryStateStore::with_clock(clock)),
    }
}

/// Re-read the monitor settings on SIGHUP and apply them to the running
/// scanner.
#[cfg(unix)]
fn spawn_config_reload(monitor: MonitorHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "config reload on SIGHUP unavailable");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match ServiceConfig::load() {
                Ok(config) => {
                    let current = monitor.current();
                    if current.timeout_monitoring_enabled != config.monitor.timeout_monitoring_enabled {
                        monitor.set_enabled(config.monitor.timeout_monitoring_enabled);
                    }
                    if current.timeout_threshold_minutes != config.monitor.timeout_threshold_minutes {
                        monitor.set_threshold_minutes(config.monitor.timeout_threshold_minutes);
                    }
                    if current.poll_interval_seconds != config.monitor.poll_interval_seconds {
                        monitor.set_poll_interval_seconds(config.monitor.poll_interval_seconds);
                    }
                }
                Err(e) => warn!(error = %e, "config reload failed, keeping current settings"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_config_reload(_monitor: MonitorHandle) {}
