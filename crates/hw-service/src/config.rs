//! Service configuration: an optional JSON file named by `HYPERWATCH_CONFIG`,
//! then individual environment overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use hw_monitor::MonitorConfig;
use hw_optimizer::AlgorithmSettings;
use hw_store::{Clock, RetryPolicy, StaticSchemaProvider};
use hw_types::{CustomRanges, ExperimentRecord, ObjectiveDirection, ParameterSpec};

pub const CONFIG_PATH_VAR: &str = "HYPERWATCH_CONFIG";
pub const TIMEOUT_MINUTES_VAR: &str = "HYPERWATCH_TIMEOUT_MINUTES";
pub const MONITORING_ENABLED_VAR: &str = "HYPERWATCH_TIMEOUT_MONITORING_ENABLED";
pub const POLL_SECONDS_VAR: &str = "HYPERWATCH_POLL_SECONDS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub monitor: MonitorConfig,
    pub retry: RetryPolicy,
    /// Parameter schemas per training target.
    pub schemas: HashMap<String, Vec<ParameterSpec>>,
    /// Experiments created at startup unless one with the same name exists.
    pub experiments: Vec<ExperimentConfig>,
    /// JSON snapshot the in-memory store is loaded from and saved to.
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub target: String,
    pub algorithm: AlgorithmSettings,
    pub max_trials: usize,
    #[serde(default)]
    pub max_resource_units: Option<f64>,
    #[serde(default = "default_concurrency")]
    pub concurrency_cap: usize,
    #[serde(default = "default_metric")]
    pub metric_name: String,
    #[serde(default)]
    pub direction: ObjectiveDirection,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub custom_ranges: CustomRanges,
}

fn default_concurrency() -> usize {
    2
}

fn default_metric() -> String {
    "val_accuracy".to_string()
}

impl ExperimentConfig {
    pub fn to_record(&self, clock: &dyn Clock) -> ExperimentRecord {
        let mut record =
            ExperimentRecord::new(&self.name, &self.target, self.algorithm.kind(), clock.now())
                .with_max_trials(self.max_trials)
                .with_concurrency(self.concurrency_cap)
                .with_objective(&self.metric_name, self.direction)
                .with_parameters(self.parameters.clone());
        record.budget.max_resource_units = self.max_resource_units;
        record
    }
}

impl ServiceConfig {
    /// Read the file named by `HYPERWATCH_CONFIG` (if set), then apply the
    /// environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config file {path}"))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(minutes) = parse_var(&lookup, TIMEOUT_MINUTES_VAR)? {
            self.monitor.timeout_threshold_minutes = minutes;
        }
        if let Some(enabled) = parse_flag(&lookup, MONITORING_ENABLED_VAR)? {
            self.monitor.timeout_monitoring_enabled = enabled;
        }
        if let Some(seconds) = parse_var(&lookup, POLL_SECONDS_VAR)? {
            self.monitor.poll_interval_seconds = seconds;
        }
        Ok(())
    }

    pub fn schema_provider(&self) -> StaticSchemaProvider {
        self.schemas
            .iter()
            .fold(StaticSchemaProvider::new(), |provider, (target, specs)| {
                provider.with_target(target.clone(), specs.clone())
            })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))
        })
        .transpose()
}

/// Boolean switch: `true`/`false` in any case, or `1`/`0`.
fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(Some(true)),
        "false" | "0" => Ok(Some(false)),
        _ => bail!("invalid value for {name}: {raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hw_store::ManualClock;
    use hw_types::AlgorithmKind;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ServiceConfig::load_with(env(&[])).unwrap();
        assert_eq!(config.monitor, MonitorConfig::default());
        assert!(config.experiments.is_empty());
    }

    #[test]
    fn environment_overrides_monitor_settings() {
        let config = ServiceConfig::load_with(env(&[
            (TIMEOUT_MINUTES_VAR, "30"),
            (MONITORING_ENABLED_VAR, "false"),
            (POLL_SECONDS_VAR, " 5 "),
        ]))
        .unwrap();
        assert_eq!(config.monitor.timeout_threshold_minutes, 30);
        assert!(!config.monitor.timeout_monitoring_enabled);
        assert_eq!(config.monitor.poll_interval_seconds, 5);
    }

    #[test]
    fn monitoring_flag_accepts_numeric_and_any_case() {
        let cases = [
            ("1", true),
            ("TRUE", true),
            ("True", true),
            ("0", false),
            ("FALSE", false),
        ];
        for (raw, expected) in cases {
            let config = ServiceConfig::load_with(env(&[(MONITORING_ENABLED_VAR, raw)])).unwrap();
            assert_eq!(config.monitor.timeout_monitoring_enabled, expected, "{raw}");
        }
        let err = ServiceConfig::load_with(env(&[(MONITORING_ENABLED_VAR, "yes")])).unwrap_err();
        assert!(err.to_string().contains(MONITORING_ENABLED_VAR));
    }

    #[test]
    fn malformed_override_is_an_error() {
        let err = ServiceConfig::load_with(env(&[(TIMEOUT_MINUTES_VAR, "soon")])).unwrap_err();
        assert!(err.to_string().contains(TIMEOUT_MINUTES_VAR));
    }

    #[test]
    fn experiment_section_parses() {
        let raw = r#"{
            "monitor": { "timeout_threshold_minutes": 20 },
            "schemas": { "mlp": [] },
            "experiments": [{
                "name": "lr-sweep",
                "target": "mlp",
                "algorithm": { "kind": "hyperband", "max_resource": 81 },
                "max_trials": 50,
                "direction": "Minimize",
                "metric_name": "val_loss"
            }]
        }"#;
        let config: ServiceConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.monitor.timeout_threshold_minutes, 20);
        assert!(config.monitor.timeout_monitoring_enabled);

        let clock = ManualClock::default();
        let record = config.experiments[0].to_record(&clock);
        assert_eq!(record.created_at, clock.now());
        assert_eq!(record.algorithm_kind, AlgorithmKind::HyperBand);
        assert_eq!(record.budget.max_trials, 50);
        assert_eq!(record.concurrency_cap, 2);
        assert_eq!(record.direction, ObjectiveDirection::Minimize);
        assert_eq!(record.metric_name, "val_loss");
    }
}
