//! HyperBand: successive halving run over brackets that trade the number of
//! configurations against the resource each one is granted.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use hw_types::{
    config_error, CustomRanges, HwError, HwResult, JobId, ObjectiveDirection,
    ParameterAssignment, SearchError,
};

use crate::search::{ExperimentSpec, Recommendation, SearchAlgorithm, SearchSpace, TrialResult};

/// Tuning knobs for [`HyperBandSearch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperBandSettings {
    /// Maximum resource (e.g. epochs) a single configuration can receive.
    pub max_resource: u32,
    /// Keep the top `1 / reduction_factor` of each rung.
    pub reduction_factor: u32,
    /// Cap on trials handed out per `recommend` call.
    pub parallelism: Option<usize>,
    /// Fixed RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for HyperBandSettings {
    fn default() -> Self {
        Self {
            max_resource: 27,
            reduction_factor: 3,
            parallelism: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Waiting,
    Running,
    Finished,
    Canceled,
}

/// One configuration's run at the active rung.
#[derive(Debug, Clone)]
struct Slot {
    config: usize,
    trial_id: Option<JobId>,
    state: SlotState,
    metric: f64,
    failed: bool,
    finished_at: Option<DateTime<Utc>>,
    finished_seq: u64,
}

impl Slot {
    fn waiting(config: usize) -> Self {
        Self {
            config,
            trial_id: None,
            state: SlotState::Waiting,
            metric: f64::NAN,
            failed: false,
            finished_at: None,
            finished_seq: 0,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, SlotState::Waiting | SlotState::Running)
    }
}

#[derive(Debug, Clone)]
struct Bracket {
    s: u32,
    rung: usize,
    /// Resource granted at rung 0.
    base_resource: f64,
    configs: Vec<ParameterAssignment>,
    slots: Vec<Slot>,
}

impl Bracket {
    fn resource(&self, reduction_factor: u32) -> f64 {
        self.base_resource * f64::from(reduction_factor).powi(self.rung as i32)
    }

    fn is_last_rung(&self) -> bool {
        self.rung >= self.s as usize
    }
}

/// HyperBand search.
#[derive(Debug)]
pub struct HyperBandSearch {
    settings: HyperBandSettings,
    rng: StdRng,
    space: Option<SearchSpace>,
    direction: ObjectiveDirection,
    s_max: u32,
    /// Next bracket to open; `None` once the last one has been opened.
    next_bracket: Option<u32>,
    bracket: Option<Bracket>,
    completions: u64,
}

impl HyperBandSearch {
    pub fn new(settings: HyperBandSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            settings,
            rng,
            space: None,
            direction: ObjectiveDirection::default(),
            s_max: 0,
            next_bracket: None,
            bracket: None,
            completions: 0,
        }
    }

    /// Largest `s` with `η^s <= R`.
    fn compute_s_max(max_resource: u32, reduction_factor: u32) -> u32 {
        let mut s = 0;
        let mut power: u64 = u64::from(reduction_factor);
        while power <= u64::from(max_resource) {
            s += 1;
            power *= u64::from(reduction_factor);
        }
        s
    }

    /// Configurations in the first rung of bracket `s`:
    /// `ceil((s_max + 1) / (s + 1) · η^s)`.
    fn bracket_size(&self, s: u32) -> usize {
        let eta_s = u64::from(self.settings.reduction_factor).pow(s);
        let numerator = u64::from(self.s_max + 1) * eta_s;
        numerator.div_ceil(u64::from(s + 1)) as usize
    }

    fn open_next_bracket(&mut self) -> HwResult<bool> {
        let Some(s) = self.next_bracket else {
            return Ok(false);
        };
        let space = self.space.as_ref().ok_or(SearchError::NotInitialized)?;
        let n = self.bracket_size(s);
        let base_resource = f64::from(self.settings.max_resource)
            / f64::from(self.settings.reduction_factor).powi(s as i32);

        let configs = (0..n)
            .map(|_| space.sample(&mut self.rng))
            .collect::<HwResult<Vec<_>>>()?;
        info!(bracket = s, configurations = n, resource = base_resource, "opening hyperband bracket");

        self.bracket = Some(Bracket {
            s,
            rung: 0,
            base_resource,
            slots: (0..n).map(Slot::waiting).collect(),
            configs,
        });
        self.next_bracket = s.checked_sub(1);
        Ok(true)
    }

    /// Once every slot of the active rung has finished or been canceled, keep
    /// the best `floor(n / η)` and move them up a rung. Failed and canceled
    /// runs are never promoted.
    fn advance_if_rung_complete(&mut self) {
        let eta = self.settings.reduction_factor as usize;
        let direction = self.direction;
        let Some(bracket) = self.bracket.as_mut() else {
            return;
        };
        if bracket.slots.iter().any(Slot::is_open) {
            return;
        }

        let keep = bracket.slots.len() / eta;
        let promoted: Vec<usize> = {
            let mut ranked: Vec<&Slot> = bracket
                .slots
                .iter()
                .filter(|slot| slot.state == SlotState::Finished && !slot.failed)
                .collect();
            ranked.sort_by(|a, b| {
                direction
                    .cmp_best_first(a.metric, b.metric)
                    .then(a.finished_at.cmp(&b.finished_at))
                    .then(a.finished_seq.cmp(&b.finished_seq))
            });
            ranked.iter().take(keep).map(|slot| slot.config).collect()
        };

        if bracket.is_last_rung() || promoted.is_empty() {
            info!(bracket = bracket.s, rung = bracket.rung, "hyperband bracket complete");
            self.bracket = None;
            return;
        }

        info!(
            bracket = bracket.s,
            rung = bracket.rung + 1,
            promoted = promoted.len(),
            eliminated = bracket.slots.len() - promoted.len(),
            "promoting hyperband rung"
        );
        bracket.rung += 1;
        bracket.slots = promoted.into_iter().map(Slot::waiting).collect();
    }

    fn active_slot(&mut self, trial_id: JobId) -> HwResult<&mut Slot> {
        self.bracket
            .as_mut()
            .and_then(|b| b.slots.iter_mut().find(|slot| slot.trial_id == Some(trial_id)))
            .ok_or_else(|| {
                SearchError::UnknownTrial {
                    trial_id: trial_id.to_string(),
                }
                .into()
            })
    }
}

fn invalid(message: String) -> HwError {
    SearchError::InvalidObservation { message }.into()
}

impl SearchAlgorithm for HyperBandSearch {
    fn name(&self) -> &str {
        "hyperband"
    }

    fn initialize(&mut self, spec: &ExperimentSpec, custom_ranges: &CustomRanges) -> HwResult<()> {
        if self.settings.reduction_factor < 2 {
            return Err(config_error!(
                "hyperband reduction_factor must be >= 2, got {}",
                self.settings.reduction_factor
            ));
        }
        if self.settings.max_resource < 1 {
            return Err(config_error!("hyperband max_resource must be >= 1"));
        }
        if self.settings.parallelism == Some(0) {
            return Err(config_error!("hyperband parallelism must be >= 1"));
        }

        let space = spec.search_space(custom_ranges)?;
        self.direction = spec.direction;
        self.s_max = Self::compute_s_max(self.settings.max_resource, self.settings.reduction_factor);
        self.next_bracket = Some(self.s_max);
        self.bracket = None;
        self.completions = 0;
        info!(
            experiment_id = %spec.experiment_id,
            s_max = self.s_max,
            max_resource = self.settings.max_resource,
            reduction_factor = self.settings.reduction_factor,
            "hyperband search initialized"
        );
        self.space = Some(space);
        Ok(())
    }

    fn recommend(&mut self, n: usize) -> HwResult<Vec<Recommendation>> {
        if self.space.is_none() {
            return Err(SearchError::NotInitialized.into());
        }
        let limit = n.min(self.settings.parallelism.unwrap_or(usize::MAX));
        let eta = self.settings.reduction_factor;

        let mut batch = Vec::new();
        while batch.len() < limit {
            if self.bracket.is_none() && !self.open_next_bracket()? {
                break;
            }
            let Some(bracket) = self.bracket.as_mut() else {
                break;
            };
            let resource = bracket.resource(eta);
            let rung = bracket.rung;
            let Some(slot) = bracket
                .slots
                .iter_mut()
                .find(|slot| slot.state == SlotState::Waiting)
            else {
                // Rung still has trials running; wait for their results.
                break;
            };

            let recommendation = Recommendation {
                trial_id: Uuid::new_v4(),
                assignment: bracket.configs[slot.config].clone(),
                rung: Some(rung),
                resource: Some(resource),
            };
            slot.trial_id = Some(recommendation.trial_id);
            slot.state = SlotState::Running;
            batch.push(recommendation);
        }
        Ok(batch)
    }

    fn observe(&mut self, result: &TrialResult) -> HwResult<()> {
        let direction = self.direction;
        let active_rung = self.bracket.as_ref().map(|b| b.rung);
        let seq = self.completions + 1;

        let slot = self.active_slot(result.trial_id)?;
        if slot.state != SlotState::Running {
            return Err(invalid(format!("trial {} is not running", result.trial_id)));
        }
        if let (Some(rung), Some(active)) = (result.rung, active_rung) {
            if rung != active {
                return Err(invalid(format!(
                    "trial {} reported rung {rung}, active rung is {active}",
                    result.trial_id
                )));
            }
        }
        slot.metric = result.objective(direction);
        slot.failed = result.is_failure();
        slot.state = SlotState::Finished;
        slot.finished_at = result.finished_at;
        slot.finished_seq = seq;
        debug!(trial_id = %result.trial_id, metric = slot.metric, "hyperband observation recorded");

        self.completions = seq;
        self.advance_if_rung_complete();
        Ok(())
    }

    fn restore(&mut self, recommendation: &Recommendation) -> HwResult<()> {
        if self.space.is_none() {
            return Err(SearchError::NotInitialized.into());
        }
        if self.bracket.is_none() && !self.open_next_bracket()? {
            return Err(invalid(format!(
                "trial {} outlives the last bracket",
                recommendation.trial_id
            )));
        }
        let Some(bracket) = self.bracket.as_mut() else {
            return Err(SearchError::NotInitialized.into());
        };
        let rung = recommendation.rung.unwrap_or(0);
        if rung != bracket.rung {
            return Err(invalid(format!(
                "trial {} belongs to rung {rung}, active rung is {}",
                recommendation.trial_id, bracket.rung
            )));
        }

        let matching = bracket.slots.iter().position(|slot| {
            slot.state == SlotState::Waiting
                && bracket.configs[slot.config] == recommendation.assignment
        });
        let idx = match matching {
            Some(idx) => idx,
            None if bracket.rung == 0 => {
                let idx = bracket
                    .slots
                    .iter()
                    .position(|slot| slot.state == SlotState::Waiting)
                    .ok_or_else(|| {
                        invalid(format!("no free slot for trial {}", recommendation.trial_id))
                    })?;
                let config = bracket.slots[idx].config;
                bracket.configs[config] = recommendation.assignment.clone();
                idx
            }
            None => {
                return Err(invalid(format!(
                    "trial {} was not promoted to rung {rung}",
                    recommendation.trial_id
                )))
            }
        };

        let slot = &mut bracket.slots[idx];
        slot.trial_id = Some(recommendation.trial_id);
        slot.state = SlotState::Running;
        Ok(())
    }

    fn cancel(&mut self, trial_id: JobId) -> HwResult<()> {
        match self.active_slot(trial_id) {
            Ok(slot) if slot.is_open() => {
                slot.state = SlotState::Canceled;
                self.advance_if_rung_complete();
            }
            Ok(_) => {}
            Err(_) => debug!(trial_id = %trial_id, "cancel for trial outside the active rung"),
        }
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.space.is_some() && self.bracket.is_none() && self.next_bracket.is_none()
    }
}
