//! # hw-optimizer
//!
//! Hyperparameter search for HyperWatch experiments.
//!
//! Provides the parameter range resolver (schema bounds, per-experiment
//! overrides, inter-parameter dependencies and numeric constraints), the
//! [`SearchAlgorithm`] trait, and its two implementations: sequential
//! Bayesian optimization with a Gaussian-process surrogate, and HyperBand
//! successive halving over brackets of increasing resource.

mod bayesian;
mod hyperband;
pub mod ranges;
mod search;

pub use bayesian::{BayesianSearch, BayesianSettings};
pub use hyperband::{HyperBandSearch, HyperBandSettings};
pub use ranges::{
    apply_math_cond, clamp_value, encode_value, fix_input_dimension, fix_power_of_factor,
    project_value, resolve_options, resolve_range, sample_value, ResolvedRange,
};
pub use search::{
    build_algorithm, AlgorithmSettings, ExperimentSpec, Recommendation, SearchAlgorithm,
    SearchSpace, TrialOutcome, TrialResult,
};
