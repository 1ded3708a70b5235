//! Search space construction and the common search-algorithm interface.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use hw_types::{
    config_error, AlgorithmKind, CustomRanges, ExperimentId, ExperimentRecord, HwResult, JobId,
    JobRecord, JobStatus, ObjectiveDirection, ParamType, ParameterAssignment, ParameterSpec,
    ParameterValue,
};

use crate::bayesian::{BayesianSearch, BayesianSettings};
use crate::hyperband::{HyperBandSearch, HyperBandSettings};
use crate::ranges::{
    base_range, effective_dependency, encode_value, project_value, resolve_options, resolve_range,
    sample_value,
};

// ---------------------------------------------------------------------------
// Search space
// ---------------------------------------------------------------------------

/// Validated, dependency-ordered set of parameters an experiment tunes.
///
/// Parents always come before the parameters that depend on them, so a
/// dependent value is resolved against its parent's value in the same
/// assignment.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    specs: Vec<ParameterSpec>,
    options: Vec<Vec<ParameterValue>>,
    overrides: CustomRanges,
}

impl SearchSpace {
    pub fn new(specs: Vec<ParameterSpec>, overrides: CustomRanges) -> HwResult<Self> {
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|other| other.name == spec.name) {
                return Err(config_error!("parameter '{}' is listed twice", spec.name));
            }
            validate_spec(spec, &overrides)?;
        }

        let specs = dependency_order(specs, &overrides)?;
        let options = specs
            .iter()
            .map(|spec| resolve_options(spec, &overrides))
            .collect();
        Ok(Self {
            specs,
            options,
            overrides,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.specs.len()
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.name.as_str())
    }

    /// Map a point of the unit cube (one coordinate per parameter, in
    /// [`specs`](Self::specs) order) onto a valid assignment.
    pub fn project(&self, point: &[f64]) -> HwResult<ParameterAssignment> {
        let mut assignment = ParameterAssignment::new();
        for (i, spec) in self.specs.iter().enumerate() {
            let range = resolve_range(spec, &assignment, &self.overrides);
            let u = point.get(i).copied().unwrap_or(0.5);
            let value = project_value(spec, &range, &self.options[i], u)?;
            assignment.insert(spec.name.clone(), value);
        }
        Ok(assignment)
    }

    /// Draw a random valid assignment.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> HwResult<ParameterAssignment> {
        let mut assignment = ParameterAssignment::new();
        for (i, spec) in self.specs.iter().enumerate() {
            let range = resolve_range(spec, &assignment, &self.overrides);
            let value = sample_value(spec, &range, &self.options[i], rng)?;
            assignment.insert(spec.name.clone(), value);
        }
        Ok(assignment)
    }

    /// Unit-cube coordinates of an assignment. Missing values sit at the centre.
    pub fn encode(&self, assignment: &ParameterAssignment) -> Vec<f64> {
        self.specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let range = resolve_range(spec, assignment, &self.overrides);
                assignment
                    .get(&spec.name)
                    .map(|value| encode_value(spec, &range, &self.options[i], value))
                    .unwrap_or(0.5)
            })
            .collect()
    }

    /// Whether every value of `assignment` lies inside its resolved range or
    /// option list.
    pub fn is_valid(&self, assignment: &ParameterAssignment) -> bool {
        self.specs.iter().enumerate().all(|(i, spec)| {
            let Some(value) = assignment.get(&spec.name) else {
                return false;
            };
            let range = resolve_range(spec, assignment, &self.overrides);
            let options = &self.options[i];
            match (spec.value_type, value) {
                (ParamType::Float, v) => v.as_f64().is_some_and(|x| range.contains(x)),
                (ParamType::Int, ParameterValue::Int(x)) => range
                    .int_bounds()
                    .is_some_and(|(lo, hi)| (lo..=hi).contains(x)),
                (ParamType::List, ParameterValue::List(items)) if options.is_empty() => items
                    .iter()
                    .all(|item| item.as_f64().is_some_and(|x| range.contains(x))),
                (ParamType::OrderedInt, v) => {
                    options.contains(v) && v.as_f64().is_some_and(|x| range.contains(x))
                }
                (_, v) => options.contains(v),
            }
        })
    }
}

fn validate_spec(spec: &ParameterSpec, overrides: &CustomRanges) -> HwResult<()> {
    let options = resolve_options(spec, overrides);
    let range = base_range(spec, overrides.get(&spec.name));
    let needs_range = match spec.value_type {
        ParamType::Float | ParamType::Int => true,
        ParamType::List => options.is_empty(),
        ParamType::OrderedInt | ParamType::Categorical | ParamType::Bool => {
            if options.is_empty() {
                return Err(config_error!("parameter '{}' has no valid options", spec.name));
            }
            false
        }
    };
    if !needs_range {
        return Ok(());
    }
    if !range.is_finite() {
        return Err(config_error!(
            "parameter '{}' has an unbounded range and no default to fall back to",
            spec.name
        ));
    }
    if range.lo > range.hi {
        return Err(config_error!(
            "parameter '{}' has inverted bounds [{}, {}]",
            spec.name,
            range.lo,
            range.hi
        ));
    }
    if spec.value_type == ParamType::Int && range.int_bounds().is_none() {
        return Err(config_error!(
            "parameter '{}' admits no integer in [{}, {}]",
            spec.name,
            range.lo,
            range.hi
        ));
    }
    Ok(())
}

/// Stable topological sort: each parameter follows the parent it depends on.
/// Parents outside the space impose no ordering.
fn dependency_order(
    mut remaining: Vec<ParameterSpec>,
    overrides: &CustomRanges,
) -> HwResult<Vec<ParameterSpec>> {
    let mut ordered: Vec<ParameterSpec> = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|spec| {
            effective_dependency(spec, overrides).map_or(true, |dep| {
                !remaining.iter().any(|other| other.name == dep.parent_param)
            })
        });
        match ready {
            Some(idx) => ordered.push(remaining.remove(idx)),
            None => {
                let names: Vec<&str> = remaining.iter().map(|s| s.name.as_str()).collect();
                return Err(config_error!(
                    "cyclic parameter dependencies among {}",
                    names.join(", ")
                ));
            }
        }
    }
    Ok(ordered)
}

// ---------------------------------------------------------------------------
// Algorithm inputs and outputs
// ---------------------------------------------------------------------------

/// What a search algorithm is initialized with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub experiment_id: ExperimentId,
    /// Every spec the schema provider returned for the experiment's target.
    pub schema: Vec<ParameterSpec>,
    /// Parameters to tune. Empty means the whole schema.
    pub parameters: Vec<String>,
    pub direction: ObjectiveDirection,
}

impl ExperimentSpec {
    pub fn new(
        experiment_id: ExperimentId,
        schema: Vec<ParameterSpec>,
        direction: ObjectiveDirection,
    ) -> Self {
        Self {
            experiment_id,
            schema,
            parameters: Vec::new(),
            direction,
        }
    }

    pub fn for_record(record: &ExperimentRecord, schema: Vec<ParameterSpec>) -> Self {
        Self {
            parameters: record.parameters.clone(),
            ..Self::new(record.id, schema, record.direction)
        }
    }

    pub fn with_parameters(mut self, names: Vec<String>) -> Self {
        self.parameters = names;
        self
    }

    /// Select and validate the tuned parameters.
    pub fn search_space(&self, custom_ranges: &CustomRanges) -> HwResult<SearchSpace> {
        if self.schema.is_empty() {
            return Err(config_error!(
                "experiment {} has an empty parameter schema",
                self.experiment_id
            ));
        }
        let selected = if self.parameters.is_empty() {
            self.schema.clone()
        } else {
            self.parameters
                .iter()
                .map(|name| {
                    self.schema
                        .iter()
                        .find(|spec| &spec.name == name)
                        .cloned()
                        .ok_or_else(|| config_error!("parameter '{name}' is not in the schema"))
                })
                .collect::<HwResult<Vec<_>>>()?
        };

        for name in custom_ranges.keys() {
            if !selected.iter().any(|spec| &spec.name == name) {
                debug!(experiment_id = %self.experiment_id, parameter = %name, "custom range for untuned parameter ignored");
            }
        }
        SearchSpace::new(selected, custom_ranges.clone())
    }
}

/// One proposed trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Id the trial record must be created with.
    pub trial_id: JobId,
    pub assignment: ParameterAssignment,
    /// HyperBand rung.
    pub rung: Option<usize>,
    /// Resource units (e.g. epochs) granted to the trial.
    pub resource: Option<f64>,
}

impl Recommendation {
    pub fn new(assignment: ParameterAssignment) -> Self {
        Self {
            trial_id: Uuid::new_v4(),
            assignment,
            rung: None,
            resource: None,
        }
    }

    /// The recommendation a persisted trial was created from.
    pub fn from_record(trial: &JobRecord) -> Option<Self> {
        Some(Self {
            trial_id: trial.id,
            assignment: trial.parameter_assignment.clone()?,
            rung: trial.rung,
            resource: trial.resource,
        })
    }
}

/// How a trial ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrialOutcome {
    Completed(f64),
    /// Explicit failure or forced timeout.
    Failed,
}

/// A finished trial fed back into the algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: JobId,
    pub assignment: ParameterAssignment,
    pub rung: Option<usize>,
    pub outcome: TrialOutcome,
    /// When the trial reached its terminal status, if known.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrialResult {
    pub fn completed(recommendation: &Recommendation, metric: f64) -> Self {
        Self::with_outcome(recommendation, TrialOutcome::Completed(metric))
    }

    pub fn failed(recommendation: &Recommendation) -> Self {
        Self::with_outcome(recommendation, TrialOutcome::Failed)
    }

    fn with_outcome(recommendation: &Recommendation, outcome: TrialOutcome) -> Self {
        Self {
            trial_id: recommendation.trial_id,
            assignment: recommendation.assignment.clone(),
            rung: recommendation.rung,
            outcome,
            finished_at: None,
        }
    }

    pub fn with_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    /// Result of a persisted terminal trial. Canceled and unfinished trials
    /// have none; a Done trial without a metric counts as failed.
    pub fn from_record(trial: &JobRecord) -> Option<Self> {
        let recommendation = Recommendation::from_record(trial)?;
        let outcome = match (trial.status, trial.metric) {
            (JobStatus::Done, Some(metric)) => TrialOutcome::Completed(metric),
            (JobStatus::Done, None) | (JobStatus::Error, _) => TrialOutcome::Failed,
            _ => return None,
        };
        Some(Self::with_outcome(&recommendation, outcome).with_finished_at(trial.last_modified))
    }

    pub fn is_failure(&self) -> bool {
        match self.outcome {
            TrialOutcome::Completed(metric) => !metric.is_finite(),
            TrialOutcome::Failed => true,
        }
    }

    /// Metric to rank by. Failures (and non-finite metrics) get the
    /// direction's worst value.
    pub fn objective(&self, direction: ObjectiveDirection) -> f64 {
        match self.outcome {
            TrialOutcome::Completed(metric) if metric.is_finite() => metric,
            _ => direction.worst_value(),
        }
    }
}

// ---------------------------------------------------------------------------
// Algorithm trait
// ---------------------------------------------------------------------------

/// Common interface of all search strategies. One instance per experiment,
/// only ever driven by that experiment's controller.
pub trait SearchAlgorithm: Send + Sync {
    fn name(&self) -> &str;

    /// Validate the tuned parameters, resolve their ranges and reset state.
    fn initialize(&mut self, spec: &ExperimentSpec, custom_ranges: &CustomRanges) -> HwResult<()>;

    /// Up to `n` new trials. Fewer (possibly none) when the algorithm is
    /// waiting on outstanding results or is exhausted.
    fn recommend(&mut self, n: usize) -> HwResult<Vec<Recommendation>>;

    /// Fold a finished trial back into the model.
    fn observe(&mut self, result: &TrialResult) -> HwResult<()>;

    /// Re-register a recommendation issued before a restart so the algorithm
    /// treats it as outstanding.
    fn restore(&mut self, recommendation: &Recommendation) -> HwResult<()>;

    /// Drop an outstanding trial without observing it.
    fn cancel(&mut self, _trial_id: JobId) -> HwResult<()> {
        Ok(())
    }

    /// No further recommendations will ever be produced.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Per-experiment algorithm configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AlgorithmSettings {
    Bayesian(BayesianSettings),
    HyperBand(HyperBandSettings),
}

impl AlgorithmSettings {
    /// Default settings for `kind`.
    pub fn for_kind(kind: AlgorithmKind) -> Self {
        match kind {
            AlgorithmKind::Bayesian => Self::Bayesian(BayesianSettings::default()),
            AlgorithmKind::HyperBand => Self::HyperBand(HyperBandSettings::default()),
        }
    }

    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Self::Bayesian(_) => AlgorithmKind::Bayesian,
            Self::HyperBand(_) => AlgorithmKind::HyperBand,
        }
    }
}

/// Build an uninitialized algorithm instance.
pub fn build_algorithm(settings: &AlgorithmSettings) -> Box<dyn SearchAlgorithm> {
    match settings {
        AlgorithmSettings::Bayesian(s) => Box::new(BayesianSearch::new(s.clone())),
        AlgorithmSettings::HyperBand(s) => Box::new(HyperBandSearch::new(s.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hw_types::{Comparator, CustomRangeOverride, HwError, MathCond};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn schema() -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::float("min_lr", 1e-6, 1e-2).with_dependency(Comparator::Lt, "max_lr"),
            ParameterSpec::float("max_lr", 1e-5, 1e-1),
            ParameterSpec::int("batch_size", 8, 128).with_math_cond(MathCond::PowerOf(2)),
            ParameterSpec::categorical("optimizer", vec!["sgd".into(), "adam".into()]),
            ParameterSpec::boolean("amp"),
        ]
    }

    #[test]
    fn parents_are_ordered_first() {
        let space = SearchSpace::new(schema(), CustomRanges::new()).unwrap();
        let names: Vec<&str> = space.names().collect();
        let parent = names.iter().position(|n| *n == "max_lr").unwrap();
        let child = names.iter().position(|n| *n == "min_lr").unwrap();
        assert!(parent < child);
    }

    #[test]
    fn cyclic_dependencies_rejected() {
        let specs = vec![
            ParameterSpec::float("a", 0.0, 1.0).with_dependency(Comparator::Lt, "b"),
            ParameterSpec::float("b", 0.0, 1.0).with_dependency(Comparator::Lt, "a"),
        ];
        assert!(matches!(
            SearchSpace::new(specs, CustomRanges::new()),
            Err(HwError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_specs_rejected() {
        let inverted = vec![ParameterSpec::float("lr", 1.0, 0.1)];
        assert!(SearchSpace::new(inverted, CustomRanges::new()).is_err());

        let unbounded = vec![ParameterSpec::float("lr", 0.0, f64::INFINITY)];
        assert!(SearchSpace::new(unbounded, CustomRanges::new()).is_err());

        let no_options = vec![ParameterSpec::categorical("opt", vec![])];
        assert!(SearchSpace::new(no_options, CustomRanges::new()).is_err());

        let mut overrides = CustomRanges::new();
        overrides.insert("lr".into(), CustomRangeOverride::range(Some(0.5), Some(0.1)));
        let overridden = vec![ParameterSpec::float("lr", 0.0, 1.0)];
        assert!(SearchSpace::new(overridden, overrides).is_err());
    }

    #[test]
    fn unknown_parameter_is_configuration_error() {
        let spec = ExperimentSpec::new(Uuid::new_v4(), schema(), ObjectiveDirection::Maximize)
            .with_parameters(vec!["max_lr".into(), "dropout".into()]);
        assert!(matches!(
            spec.search_space(&CustomRanges::new()),
            Err(HwError::Configuration(msg)) if msg.contains("dropout")
        ));

        let empty = ExperimentSpec::new(Uuid::new_v4(), vec![], ObjectiveDirection::Maximize);
        assert!(empty.search_space(&CustomRanges::new()).is_err());
    }

    #[test]
    fn samples_respect_dependencies() {
        let space = SearchSpace::new(schema(), CustomRanges::new()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let assignment = space.sample(&mut rng).unwrap();
            assert!(space.is_valid(&assignment), "{assignment:?}");
            let min_lr = assignment["min_lr"].as_f64().unwrap();
            let max_lr = assignment["max_lr"].as_f64().unwrap();
            assert!(min_lr < max_lr);
        }
    }

    #[test]
    fn projection_of_corners_is_valid() {
        let space = SearchSpace::new(schema(), CustomRanges::new()).unwrap();
        for corner in [0.0, 1.0] {
            let point = vec![corner; space.dimensions()];
            let assignment = space.project(&point).unwrap();
            assert!(space.is_valid(&assignment), "{assignment:?}");
        }
    }

    #[test]
    fn result_from_record_maps_status() {
        let mut assignment = ParameterAssignment::new();
        assignment.insert("x".into(), ParameterValue::Float(0.5));
        let mut trial = JobRecord::new_trial(Uuid::new_v4(), 0, assignment, Utc::now());
        assert!(TrialResult::from_record(&trial).is_none());

        let finished = Utc::now() + chrono::Duration::minutes(5);
        trial.record_status(JobStatus::Done, None, finished).unwrap();
        trial.metric = Some(0.8);
        let result = TrialResult::from_record(&trial).unwrap();
        assert_eq!(result.outcome, TrialOutcome::Completed(0.8));
        assert_eq!(result.finished_at, Some(finished));

        trial.status = JobStatus::Error;
        let result = TrialResult::from_record(&trial).unwrap();
        assert!(result.is_failure());
        assert_eq!(result.objective(ObjectiveDirection::Maximize), f64::MIN);
        assert_eq!(result.objective(ObjectiveDirection::Minimize), f64::MAX);

        trial.status = JobStatus::Canceled;
        assert!(TrialResult::from_record(&trial).is_none());
    }

    #[test]
    fn factory_builds_requested_kind() {
        for kind in [AlgorithmKind::Bayesian, AlgorithmKind::HyperBand] {
            let settings = AlgorithmSettings::for_kind(kind);
            assert_eq!(settings.kind(), kind);
            assert_eq!(build_algorithm(&settings).name(), kind.to_string());
        }
    }

    #[test]
    fn settings_deserialize_with_kind_tag() {
        let settings: AlgorithmSettings =
            serde_json::from_str(r#"{"kind": "hyperband", "max_resource": 9}"#).unwrap();
        match settings {
            AlgorithmSettings::HyperBand(s) => {
                assert_eq!(s.max_resource, 9);
                assert_eq!(s.reduction_factor, 3);
            }
            other => panic!("unexpected settings {other:?}"),
        }
    }
}
