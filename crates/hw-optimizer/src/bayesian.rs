//! Sequential Bayesian optimization.
//!
//! The first `initial_random` trials come from a Latin-hypercube design over
//! the unit cube. After that a Gaussian-process surrogate (RBF kernel) is fit
//! to the observed trials and the candidate with the highest Expected
//! Improvement is projected onto a valid assignment.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};
use tracing::{debug, info, warn};

use hw_types::{CustomRanges, HwError, HwResult, JobId, ObjectiveDirection, SearchError};

use crate::search::{ExperimentSpec, Recommendation, SearchAlgorithm, SearchSpace, TrialResult};

/// Tuning knobs for [`BayesianSearch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesianSettings {
    /// Quasi-random trials before the surrogate takes over.
    pub initial_random: usize,
    /// Random candidates scored per recommendation.
    pub candidate_pool: usize,
    /// Upper bound on points the surrogate is fit to (best first).
    pub max_training_points: usize,
    /// RBF length scale in unit-cube coordinates.
    pub length_scale: f64,
    /// Observation noise added to the kernel diagonal.
    pub noise: f64,
    /// Exploration margin in Expected Improvement.
    pub xi: f64,
    /// Fixed RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for BayesianSettings {
    fn default() -> Self {
        Self {
            initial_random: 5,
            candidate_pool: 256,
            max_training_points: 128,
            length_scale: 0.25,
            noise: 1e-6,
            xi: 0.01,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Observation {
    trial_id: JobId,
    x: Vec<f64>,
    /// Objective with failures already mapped to the worst value.
    y: f64,
    failed: bool,
}

/// Gaussian-process Bayesian optimization.
#[derive(Debug)]
pub struct BayesianSearch {
    settings: BayesianSettings,
    rng: StdRng,
    space: Option<SearchSpace>,
    direction: ObjectiveDirection,
    warmup: Vec<Vec<f64>>,
    issued: usize,
    pending: Vec<(JobId, Vec<f64>)>,
    observations: Vec<Observation>,
}

impl BayesianSearch {
    pub fn new(settings: BayesianSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            settings,
            rng,
            space: None,
            direction: ObjectiveDirection::default(),
            warmup: Vec::new(),
            issued: 0,
            pending: Vec::new(),
            observations: Vec::new(),
        }
    }

    /// Number of trials observed so far.
    pub fn observed(&self) -> usize {
        self.observations.len()
    }

    fn next_point(&mut self, dims: usize) -> Vec<f64> {
        if let Some(point) = self.warmup.get(self.issued) {
            return point.clone();
        }
        if self.observations.is_empty() {
            return random_point(dims, &mut self.rng);
        }
        match self.propose(dims) {
            Ok(point) => point,
            Err(e) => {
                warn!(error = %e, "surrogate unavailable, sampling at random");
                random_point(dims, &mut self.rng)
            }
        }
    }

    /// Fit the surrogate and return the candidate maximizing Expected
    /// Improvement. Outstanding trials enter the fit at the mean observed
    /// value so a batch does not collapse onto one point.
    fn propose(&mut self, dims: usize) -> HwResult<Vec<f64>> {
        let (xs, ys) = self.training_set();
        let best = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lie = ys.iter().sum::<f64>() / ys.len() as f64;

        let mut train_x = xs;
        let mut train_y = ys;
        for (_, x) in &self.pending {
            train_x.push(x.clone());
            train_y.push(lie);
        }

        let gp = GaussianProcess::fit(
            train_x,
            &train_y,
            self.settings.length_scale,
            self.settings.noise,
        )?;
        let mut candidates = self.candidates(dims);
        let xi = self.settings.xi;
        let scores: Vec<f64> = candidates
            .par_iter()
            .map(|c| gp.expected_improvement(c, best, xi))
            .collect();

        // First maximum wins so ties go to the earliest candidate.
        let mut best_idx = 0;
        for (i, score) in scores.iter().enumerate() {
            if *score > scores[best_idx] {
                best_idx = i;
            }
        }
        debug!(candidates = candidates.len(), ei = scores[best_idx], "selected surrogate candidate");
        Ok(candidates.swap_remove(best_idx))
    }

    /// Observations in maximize orientation, failures replaced by the worst
    /// real observation, capped at the best `max_training_points`.
    fn training_set(&self) -> (Vec<Vec<f64>>, Vec<f64>) {
        let sign = match self.direction {
            ObjectiveDirection::Maximize => 1.0,
            ObjectiveDirection::Minimize => -1.0,
        };
        let floor = self
            .observations
            .iter()
            .filter(|o| !o.failed)
            .map(|o| sign * o.y)
            .fold(f64::INFINITY, f64::min);
        let floor = if floor.is_finite() { floor } else { 0.0 };

        let mut points: Vec<(usize, f64)> = self
            .observations
            .iter()
            .enumerate()
            .map(|(i, o)| (i, if o.failed { floor } else { sign * o.y }))
            .collect();
        points.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        points.truncate(self.settings.max_training_points.max(1));

        points
            .into_iter()
            .map(|(i, y)| (self.observations[i].x.clone(), y))
            .unzip()
    }

    /// Uniform candidates plus local perturbations of the incumbent.
    fn candidates(&mut self, dims: usize) -> Vec<Vec<f64>> {
        let pool = self.settings.candidate_pool.max(1);
        let local = pool / 4;
        let incumbent = self.incumbent().map(|o| o.x.clone());

        let mut candidates = Vec::with_capacity(pool);
        for _ in 0..pool - local {
            candidates.push(random_point(dims, &mut self.rng));
        }
        if let Some(center) = incumbent {
            for _ in 0..local {
                let point = center
                    .iter()
                    .map(|c| (c + self.rng.random_range(-0.1..0.1)).clamp(0.0, 1.0))
                    .collect();
                candidates.push(point);
            }
        }
        candidates
    }

    /// Best real observation; ties go to the earliest.
    fn incumbent(&self) -> Option<&Observation> {
        let mut best: Option<&Observation> = None;
        for obs in self.observations.iter().filter(|o| !o.failed) {
            if best.map_or(true, |b| self.direction.is_better(obs.y, b.y)) {
                best = Some(obs);
            }
        }
        best
    }
}

impl SearchAlgorithm for BayesianSearch {
    fn name(&self) -> &str {
        "bayesian"
    }

    fn initialize(&mut self, spec: &ExperimentSpec, custom_ranges: &CustomRanges) -> HwResult<()> {
        let space = spec.search_space(custom_ranges)?;
        self.direction = spec.direction;
        self.warmup = latin_hypercube(self.settings.initial_random, space.dimensions(), &mut self.rng);
        self.issued = 0;
        self.pending.clear();
        self.observations.clear();
        info!(
            experiment_id = %spec.experiment_id,
            dimensions = space.dimensions(),
            initial_random = self.settings.initial_random,
            "bayesian search initialized"
        );
        self.space = Some(space);
        Ok(())
    }

    fn recommend(&mut self, n: usize) -> HwResult<Vec<Recommendation>> {
        let dims = self
            .space
            .as_ref()
            .map(SearchSpace::dimensions)
            .ok_or(SearchError::NotInitialized)?;

        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            let point = self.next_point(dims);
            let space = self.space.as_ref().ok_or(SearchError::NotInitialized)?;
            let assignment = space.project(&point)?;
            let x = space.encode(&assignment);
            let recommendation = Recommendation::new(assignment);
            self.pending.push((recommendation.trial_id, x));
            self.issued += 1;
            batch.push(recommendation);
        }
        Ok(batch)
    }

    fn observe(&mut self, result: &TrialResult) -> HwResult<()> {
        let space = self.space.as_ref().ok_or(SearchError::NotInitialized)?;
        if self.observations.iter().any(|o| o.trial_id == result.trial_id) {
            return Err(SearchError::InvalidObservation {
                message: format!("trial {} already observed", result.trial_id),
            }
            .into());
        }
        let x = space.encode(&result.assignment);
        self.pending.retain(|(id, _)| *id != result.trial_id);
        self.observations.push(Observation {
            trial_id: result.trial_id,
            x,
            y: result.objective(self.direction),
            failed: result.is_failure(),
        });
        debug!(trial_id = %result.trial_id, observed = self.observations.len(), "bayesian observation recorded");
        Ok(())
    }

    fn restore(&mut self, recommendation: &Recommendation) -> HwResult<()> {
        let space = self.space.as_ref().ok_or(SearchError::NotInitialized)?;
        let x = space.encode(&recommendation.assignment);
        self.pending.push((recommendation.trial_id, x));
        self.issued += 1;
        Ok(())
    }

    fn cancel(&mut self, trial_id: JobId) -> HwResult<()> {
        self.pending.retain(|(id, _)| *id != trial_id);
        Ok(())
    }
}

fn random_point<R: Rng + ?Sized>(dims: usize, rng: &mut R) -> Vec<f64> {
    (0..dims).map(|_| rng.random::<f64>()).collect()
}

/// `n` points in `[0, 1)^dims`, one per stratum along every axis.
fn latin_hypercube<R: Rng + ?Sized>(n: usize, dims: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut points = vec![vec![0.0; dims]; n];
    for d in 0..dims {
        let mut strata: Vec<usize> = (0..n).collect();
        strata.shuffle(rng);
        for (point, stratum) in points.iter_mut().zip(strata) {
            point[d] = (stratum as f64 + rng.random::<f64>()) / n as f64;
        }
    }
    points
}

// ---------------------------------------------------------------------------
// Gaussian-process surrogate
// ---------------------------------------------------------------------------

const JITTER_ATTEMPTS: usize = 4;

#[derive(Debug, Clone)]
struct GaussianProcess {
    xs: Vec<Vec<f64>>,
    /// Lower Cholesky factor of the kernel matrix.
    chol: Vec<Vec<f64>>,
    alpha: Vec<f64>,
    length_scale: f64,
    y_mean: f64,
    y_std: f64,
}

impl GaussianProcess {
    fn fit(xs: Vec<Vec<f64>>, ys: &[f64], length_scale: f64, noise: f64) -> HwResult<Self> {
        if xs.is_empty() {
            return Err(surrogate_error("no training points"));
        }
        let n = ys.len();
        let y_mean = ys.iter().sum::<f64>() / n as f64;
        let var = ys.iter().map(|y| (y - y_mean).powi(2)).sum::<f64>() / n as f64;
        let y_std = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
        let y_norm: Vec<f64> = ys.iter().map(|y| (y - y_mean) / y_std).collect();

        let mut jitter = noise.max(1e-10);
        let mut chol = None;
        for _ in 0..JITTER_ATTEMPTS {
            let kernel: Vec<Vec<f64>> = (0..n)
                .map(|i| {
                    (0..n)
                        .map(|j| {
                            let k = rbf(&xs[i], &xs[j], length_scale);
                            if i == j {
                                k + jitter
                            } else {
                                k
                            }
                        })
                        .collect()
                })
                .collect();
            chol = cholesky(&kernel);
            if chol.is_some() {
                break;
            }
            jitter *= 100.0;
        }
        let chol = chol.ok_or_else(|| surrogate_error("kernel matrix is not positive definite"))?;
        let alpha = solve_upper_transposed(&chol, &solve_lower(&chol, &y_norm));

        Ok(Self {
            xs,
            chol,
            alpha,
            length_scale,
            y_mean,
            y_std,
        })
    }

    /// Posterior mean and standard deviation at `x`, in objective units.
    fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k_star: Vec<f64> = self.xs.iter().map(|xi| rbf(xi, x, self.length_scale)).collect();
        let mean: f64 = k_star.iter().zip(&self.alpha).map(|(k, a)| k * a).sum();
        let v = solve_lower(&self.chol, &k_star);
        let var = (1.0 - v.iter().map(|vi| vi * vi).sum::<f64>()).max(1e-12);
        (mean * self.y_std + self.y_mean, var.sqrt() * self.y_std)
    }

    /// Expected Improvement over `best` (maximize orientation).
    fn expected_improvement(&self, x: &[f64], best: f64, xi: f64) -> f64 {
        let (mean, std) = self.predict(x);
        let improvement = mean - best - xi;
        if std < 1e-9 {
            return improvement.max(0.0);
        }
        let z = improvement / std;
        improvement * normal_cdf(z) + std * normal_pdf(z)
    }
}

fn surrogate_error(message: &str) -> HwError {
    SearchError::Surrogate {
        message: message.to_string(),
    }
    .into()
}

fn rbf(a: &[f64], b: &[f64], length_scale: f64) -> f64 {
    let sq: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    (-sq / (2.0 * length_scale * length_scale)).exp()
}

fn cholesky(matrix: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = matrix.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let diag = matrix[i][i] - sum;
                if diag <= 0.0 || !diag.is_finite() {
                    return None;
                }
                l[i][j] = diag.sqrt();
            } else {
                l[i][j] = (matrix[i][j] - sum) / l[j][j];
            }
        }
    }
    Some(l)
}

/// Solve `L x = b` for lower-triangular `L`.
fn solve_lower(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in 0..n {
        let sum: f64 = (0..i).map(|k| l[i][k] * x[k]).sum();
        x[i] = (b[i] - sum) / l[i][i];
    }
    x
}

/// Solve `Lᵀ x = b` for lower-triangular `L`.
fn solve_upper_transposed(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| l[k][i] * x[k]).sum();
        x[i] = (b[i] - sum) / l[i][i];
    }
    x
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * PI).sqrt()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

/// Abramowitz & Stegun 7.1.26, max error 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::TrialOutcome;
    use hw_types::ParameterSpec;
    use uuid::Uuid;

    fn settings(seed: u64) -> BayesianSettings {
        BayesianSettings {
            candidate_pool: 64,
            max_training_points: 40,
            seed: Some(seed),
            ..BayesianSettings::default()
        }
    }

    fn init(search: &mut BayesianSearch, specs: Vec<ParameterSpec>, direction: ObjectiveDirection) {
        let spec = ExperimentSpec::new(Uuid::new_v4(), specs, direction);
        search.initialize(&spec, &CustomRanges::new()).unwrap();
    }

    fn x_of(rec: &Recommendation) -> f64 {
        rec.assignment["x"].as_f64().unwrap()
    }

    #[test]
    fn recommend_before_initialize_fails() {
        let mut search = BayesianSearch::new(settings(1));
        assert!(matches!(
            search.recommend(1),
            Err(HwError::Search(SearchError::NotInitialized))
        ));
    }

    #[test]
    fn warmup_is_stratified() {
        let mut search = BayesianSearch::new(settings(3));
        init(&mut search, vec![ParameterSpec::float("x", 0.0, 1.0)], ObjectiveDirection::Maximize);

        let batch = search.recommend(5).unwrap();
        let mut strata: Vec<usize> = batch.iter().map(|r| (x_of(r) * 5.0).floor() as usize).collect();
        strata.sort_unstable();
        assert_eq!(strata, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn thousand_recommendations_stay_in_bounds() {
        let mut search = BayesianSearch::new(BayesianSettings {
            candidate_pool: 16,
            max_training_points: 16,
            ..settings(5)
        });
        let specs = vec![
            ParameterSpec::float("x", -2.0, 3.0),
            ParameterSpec::int("layers", 2, 9),
            ParameterSpec::categorical("act", vec!["relu".into(), "gelu".into()]),
        ];
        init(&mut search, specs, ObjectiveDirection::Maximize);

        for i in 0..1000 {
            let rec = search.recommend(1).unwrap().remove(0);
            let x = x_of(&rec);
            let layers = rec.assignment["layers"].as_i64().unwrap();
            assert!((-2.0..=3.0).contains(&x), "x = {x}");
            assert!((2..=9).contains(&layers), "layers = {layers}");
            let metric = -(x - 1.0).powi(2) + (i % 7) as f64 * 1e-3;
            search.observe(&TrialResult::completed(&rec, metric)).unwrap();
        }
        assert_eq!(search.observed(), 1000);
    }

    fn optimise(direction: ObjectiveDirection, target: f64) -> f64 {
        let mut search = BayesianSearch::new(settings(17));
        init(&mut search, vec![ParameterSpec::float("x", 0.0, 1.0)], direction);
        let objective = |x: f64| match direction {
            ObjectiveDirection::Maximize => -(x - target).powi(2),
            ObjectiveDirection::Minimize => (x - target).powi(2),
        };

        let mut best: Option<(f64, f64)> = None;
        for _ in 0..25 {
            let rec = search.recommend(1).unwrap().remove(0);
            let x = x_of(&rec);
            let y = objective(x);
            if best.map_or(true, |(_, b)| direction.is_better(y, b)) {
                best = Some((x, y));
            }
            search.observe(&TrialResult::completed(&rec, y)).unwrap();
        }
        best.map(|(x, _)| x).unwrap()
    }

    #[test]
    fn converges_when_maximizing() {
        let x = optimise(ObjectiveDirection::Maximize, 0.7);
        assert!((x - 0.7).abs() < 0.1, "best x = {x}");
    }

    #[test]
    fn converges_when_minimizing() {
        let x = optimise(ObjectiveDirection::Minimize, 0.3);
        assert!((x - 0.3).abs() < 0.1, "best x = {x}");
    }

    #[test]
    fn failures_do_not_break_the_surrogate() {
        let mut search = BayesianSearch::new(BayesianSettings {
            initial_random: 2,
            ..settings(9)
        });
        init(&mut search, vec![ParameterSpec::float("x", 0.0, 1.0)], ObjectiveDirection::Minimize);

        let batch = search.recommend(2).unwrap();
        search.observe(&TrialResult::completed(&batch[0], 0.4)).unwrap();
        search.observe(&TrialResult::failed(&batch[1])).unwrap();

        let next = search.recommend(3).unwrap();
        assert_eq!(next.len(), 3);
        assert!(next.iter().all(|r| (0.0..=1.0).contains(&x_of(r))));
    }

    #[test]
    fn duplicate_observation_rejected() {
        let mut search = BayesianSearch::new(settings(2));
        init(&mut search, vec![ParameterSpec::float("x", 0.0, 1.0)], ObjectiveDirection::Maximize);
        let rec = search.recommend(1).unwrap().remove(0);
        let result = TrialResult {
            outcome: TrialOutcome::Completed(0.5),
            ..TrialResult::failed(&rec)
        };
        search.observe(&result).unwrap();
        assert!(search.observe(&result).is_err());
    }

    #[test]
    fn gp_interpolates_training_points() {
        let xs = vec![vec![0.1], vec![0.5], vec![0.9]];
        let ys = [1.0, 3.0, 2.0];
        let gp = GaussianProcess::fit(xs, &ys, 0.25, 1e-8).unwrap();
        let (mean, std) = gp.predict(&[0.5]);
        assert!((mean - 3.0).abs() < 1e-3);
        assert!(std < 1e-2);
        assert!(gp.expected_improvement(&[0.5], 3.0, 0.0) < 1e-3);
    }

    #[test]
    fn normal_cdf_matches_table() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
    }
}
