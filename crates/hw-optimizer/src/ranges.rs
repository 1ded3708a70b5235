//! Parameter range resolution.
//!
//! Turns a schema [`ParameterSpec`] plus the experiment's custom overrides and
//! the values already chosen for other parameters into the concrete interval
//! or option list a value may be drawn from, and maps unit-cube coordinates
//! onto valid values.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hw_types::{
    Comparator, CustomRangeOverride, CustomRanges, Dependency, HwError, HwResult, MathCond,
    ParamType, ParameterAssignment, ParameterSpec, ParameterValue, SearchError,
};

/// Float ranges spanning at least this many orders of magnitude ratio are
/// searched in log space (learning rates, weight decay).
const LOG_SCALE_RATIO: f64 = 1e3;

/// Relative step used to move off an exclusive bound.
const EXCLUSIVE_NUDGE: f64 = 1e-9;

/// Concrete numeric interval a parameter may take.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRange {
    pub lo: f64,
    pub hi: f64,
    pub lo_inclusive: bool,
    pub hi_inclusive: bool,
}

impl ResolvedRange {
    pub fn closed(lo: f64, hi: f64) -> Self {
        Self {
            lo,
            hi,
            lo_inclusive: true,
            hi_inclusive: true,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        let above = if self.lo_inclusive {
            value >= self.lo
        } else {
            value > self.lo
        };
        let below = if self.hi_inclusive {
            value <= self.hi
        } else {
            value < self.hi
        };
        above && below
    }

    pub fn is_finite(&self) -> bool {
        self.lo.is_finite() && self.hi.is_finite()
    }

    /// No real value satisfies both bounds.
    pub fn is_empty(&self) -> bool {
        self.lo > self.hi || (self.lo == self.hi && !(self.lo_inclusive && self.hi_inclusive))
    }

    /// Inclusive integer bounds honoring exclusivity, if any integer fits.
    pub fn int_bounds(&self) -> Option<(i64, i64)> {
        if !self.is_finite() {
            return None;
        }
        let mut lo = self.lo.ceil();
        if !self.lo_inclusive && lo == self.lo {
            lo += 1.0;
        }
        let mut hi = self.hi.floor();
        if !self.hi_inclusive && hi == self.hi {
            hi -= 1.0;
        }
        (lo <= hi).then_some((lo as i64, hi as i64))
    }

    fn log_scaled(&self) -> bool {
        self.lo > 0.0 && self.hi / self.lo >= LOG_SCALE_RATIO
    }
}

// ---------------------------------------------------------------------------
// Range and option resolution
// ---------------------------------------------------------------------------

/// Schema bounds with infinite ends replaced by the default value and custom
/// min/max applied. Dependencies are not considered.
pub fn base_range(spec: &ParameterSpec, custom: Option<&CustomRangeOverride>) -> ResolvedRange {
    let mut lo = spec.valid_min;
    let mut hi = spec.valid_max;
    if let Some(default) = spec.default_f64() {
        if !lo.is_finite() {
            lo = default;
        }
        if !hi.is_finite() {
            hi = default;
        }
    }
    if let Some(custom) = custom {
        if let Some(min) = custom.valid_min {
            lo = min;
        }
        if let Some(max) = custom.valid_max {
            hi = max;
        }
    }
    ResolvedRange::closed(lo, hi)
}

/// The dependency in force for `spec`: a custom override replaces the schema's.
pub fn effective_dependency<'a>(
    spec: &'a ParameterSpec,
    overrides: &'a CustomRanges,
) -> Option<&'a Dependency> {
    overrides
        .get(&spec.name)
        .and_then(|custom| custom.depends_on.as_ref())
        .or(spec.depends_on.as_ref())
}

/// Resolve the interval a value of `spec` may be drawn from, given the values
/// already chosen for other parameters of the same assignment.
///
/// A dependency whose parent has no value yet, or that would leave no valid
/// value, is ignored and the undependent range is returned.
pub fn resolve_range(
    spec: &ParameterSpec,
    parent_values: &ParameterAssignment,
    overrides: &CustomRanges,
) -> ResolvedRange {
    let base = base_range(spec, overrides.get(&spec.name));
    let Some(dependency) = effective_dependency(spec, overrides) else {
        return base;
    };

    match apply_dependency(&spec.name, base, dependency, parent_values) {
        Ok(range) if has_valid_value(spec, &range) => range,
        Ok(range) => {
            debug!(
                parameter = %spec.name,
                dependency = %dependency,
                lo = range.lo,
                hi = range.hi,
                "dependency leaves no valid value, using default range"
            );
            base
        }
        Err(e) => {
            debug!(parameter = %spec.name, error = %e, "ignoring unresolved dependency");
            base
        }
    }
}

fn apply_dependency(
    name: &str,
    mut range: ResolvedRange,
    dependency: &Dependency,
    parent_values: &ParameterAssignment,
) -> HwResult<ResolvedRange> {
    let parent = parent_values
        .get(&dependency.parent_param)
        .and_then(ParameterValue::as_f64)
        .ok_or_else(|| HwError::DependencyUnresolved {
            parameter: name.to_string(),
            parent: dependency.parent_param.clone(),
        })?;

    match dependency.comparator {
        Comparator::Gt | Comparator::Ge => {
            let inclusive = dependency.comparator == Comparator::Ge;
            if parent > range.lo || (parent == range.lo && !inclusive) {
                range.lo = parent;
                range.lo_inclusive = inclusive;
            }
        }
        Comparator::Lt | Comparator::Le => {
            let inclusive = dependency.comparator == Comparator::Le;
            if parent < range.hi || (parent == range.hi && !inclusive) {
                range.hi = parent;
                range.hi_inclusive = inclusive;
            }
        }
    }
    Ok(range)
}

fn has_valid_value(spec: &ParameterSpec, range: &ResolvedRange) -> bool {
    match spec.value_type {
        ParamType::Int => range.int_bounds().is_some(),
        _ => !range.is_empty(),
    }
}

/// Option list for categorical-like parameters. A non-empty custom list
/// replaces the schema's; an empty or missing one falls back to it.
pub fn resolve_options(spec: &ParameterSpec, overrides: &CustomRanges) -> Vec<ParameterValue> {
    match overrides
        .get(&spec.name)
        .and_then(|custom| custom.valid_options.as_ref())
    {
        Some(options) if !options.is_empty() => options.clone(),
        _ => spec.valid_options.clone(),
    }
}

// ---------------------------------------------------------------------------
// Secondary constraints
// ---------------------------------------------------------------------------

/// Clamp `value` into `range`. Values outside land on the nearest boundary,
/// nudged inward when that boundary is exclusive.
pub fn clamp_value(value: f64, range: &ResolvedRange) -> f64 {
    if range.contains(value) {
        return value;
    }
    if range.is_empty() {
        return range.lo;
    }
    let width = range.hi - range.lo;
    if value.is_nan() || value <= range.lo {
        if range.lo_inclusive {
            range.lo
        } else {
            nudge(range.lo, width)
        }
    } else if range.hi_inclusive {
        range.hi
    } else {
        nudge(range.hi, -width)
    }
}

fn nudge(bound: f64, width: f64) -> f64 {
    let step = (width.abs() * EXCLUSIVE_NUDGE).max(f64::EPSILON * bound.abs().max(1.0));
    if step >= width.abs() / 2.0 {
        bound + width / 2.0
    } else {
        bound + step.copysign(width)
    }
}

/// Round to the nearest multiple of `factor`, never below `factor` itself.
/// `fix_input_dimension(50, 32) == 64`.
pub fn fix_input_dimension(value: i64, factor: i64) -> i64 {
    apply_math_cond(value, MathCond::MultipleOf(factor), factor.max(1), i64::MAX)
}

/// Round to the nearest power of `factor` (exponent at least 1).
/// Non-positive inputs become `factor`.
pub fn fix_power_of_factor(value: i64, factor: i64) -> i64 {
    apply_math_cond(value, MathCond::PowerOf(factor), factor.max(1), i64::MAX)
}

/// Snap `value` onto a value in `[lo, hi]` satisfying `cond`.
///
/// The nearest satisfying value wins (ties round up). If it falls below `lo`
/// the smallest satisfying value at or above `lo` is used instead; if no
/// satisfying value exists in range, the closest boundary is returned.
pub fn apply_math_cond(value: i64, cond: MathCond, lo: i64, hi: i64) -> i64 {
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    let degenerate = match cond {
        MathCond::MultipleOf(f) => f < 1,
        MathCond::PowerOf(f) => f < 2,
    };
    if degenerate {
        return value.clamp(lo, hi);
    }

    let mut candidate = Some(nearest_satisfying(value, cond));
    if candidate.is_some_and(|c| c < lo) {
        candidate = first_at_or_above(lo, cond);
    }
    if candidate.is_some_and(|c| c > hi) {
        candidate = last_at_or_below(hi, cond);
    }
    match candidate {
        Some(c) if c >= lo && c <= hi => c,
        _ => closest_boundary(value, lo, hi),
    }
}

fn closest_boundary(value: i64, lo: i64, hi: i64) -> i64 {
    if value <= lo {
        lo
    } else if value >= hi {
        hi
    } else if value - lo < hi - value {
        lo
    } else {
        hi
    }
}

fn powers(factor: i64) -> impl Iterator<Item = i64> {
    std::iter::successors(Some(factor), move |p| p.checked_mul(factor))
}

fn nearest_satisfying(value: i64, cond: MathCond) -> i64 {
    match cond {
        MathCond::MultipleOf(f) => {
            let rem = value.rem_euclid(f);
            let down = value - rem;
            if rem.saturating_mul(2) >= f {
                down.saturating_add(f)
            } else {
                down
            }
        }
        MathCond::PowerOf(f) => {
            let mut below = None;
            for p in powers(f) {
                if p >= value {
                    return match below {
                        Some(q) if value - q < p - value => q,
                        _ => p,
                    };
                }
                below = Some(p);
            }
            below.unwrap_or(f)
        }
    }
}

fn first_at_or_above(bound: i64, cond: MathCond) -> Option<i64> {
    match cond {
        MathCond::MultipleOf(f) => {
            let rem = bound.rem_euclid(f);
            if rem == 0 {
                Some(bound)
            } else {
                bound.checked_add(f - rem)
            }
        }
        MathCond::PowerOf(f) => powers(f).find(|p| *p >= bound),
    }
}

fn last_at_or_below(bound: i64, cond: MathCond) -> Option<i64> {
    match cond {
        MathCond::MultipleOf(f) => bound.checked_sub(bound.rem_euclid(f)),
        MathCond::PowerOf(f) => powers(f).take_while(|p| *p <= bound).last(),
    }
}

// ---------------------------------------------------------------------------
// Generation and projection
// ---------------------------------------------------------------------------

fn empty_domain(spec: &ParameterSpec, message: impl Into<String>) -> HwError {
    SearchError::EmptyDomain {
        parameter: spec.name.clone(),
        message: message.into(),
    }
    .into()
}

/// Options that are still admissible under `range`. Only ordered integers are
/// narrowed; if nothing survives the full list is kept.
fn admissible_options<'a>(
    spec: &ParameterSpec,
    range: &ResolvedRange,
    options: &'a [ParameterValue],
) -> Vec<&'a ParameterValue> {
    if spec.value_type == ParamType::OrderedInt {
        let narrowed: Vec<_> = options
            .iter()
            .filter(|o| o.as_f64().is_some_and(|v| range.contains(v)))
            .collect();
        if !narrowed.is_empty() {
            return narrowed;
        }
    }
    options.iter().collect()
}

fn pick_option(
    spec: &ParameterSpec,
    range: &ResolvedRange,
    options: &[ParameterValue],
    u: f64,
) -> HwResult<ParameterValue> {
    let admissible = admissible_options(spec, range, options);
    if admissible.is_empty() {
        return Err(empty_domain(spec, "no valid options"));
    }
    let idx = ((u * admissible.len() as f64).floor() as usize).min(admissible.len() - 1);
    Ok(admissible[idx].clone())
}

fn project_float(range: &ResolvedRange, u: f64) -> f64 {
    let x = if range.log_scaled() {
        let (lo, hi) = (range.lo.ln(), range.hi.ln());
        (lo + u * (hi - lo)).exp()
    } else {
        range.lo + u * (range.hi - range.lo)
    };
    clamp_value(x, range)
}

fn list_len(spec: &ParameterSpec) -> usize {
    match &spec.default_value {
        Some(ParameterValue::List(items)) if !items.is_empty() => items.len(),
        _ => 1,
    }
}

/// Map a unit coordinate `u ∈ [0, 1]` onto a valid value of `spec`.
///
/// Integers round to the nearest admissible integer and then satisfy the
/// spec's math condition; option-typed parameters pick the bucket `u` falls in.
pub fn project_value(
    spec: &ParameterSpec,
    range: &ResolvedRange,
    options: &[ParameterValue],
    u: f64,
) -> HwResult<ParameterValue> {
    let u = if u.is_nan() { 0.5 } else { u.clamp(0.0, 1.0) };
    match spec.value_type {
        ParamType::Float => {
            if range.is_empty() || !range.is_finite() {
                return Err(empty_domain(spec, format!("unusable range [{}, {}]", range.lo, range.hi)));
            }
            Ok(ParameterValue::Float(project_float(range, u)))
        }
        ParamType::Int => {
            let (lo, hi) = range
                .int_bounds()
                .ok_or_else(|| empty_domain(spec, "no integer in range"))?;
            // i128 so spans near the i64 limits cannot overflow.
            let span = i128::from(hi) - i128::from(lo);
            let offset = (u * span as f64).round() as i128;
            let value = (i128::from(lo) + offset).clamp(i128::from(lo), i128::from(hi)) as i64;
            let value = match spec.math_cond {
                Some(cond) => apply_math_cond(value, cond, lo, hi),
                None => value,
            };
            Ok(ParameterValue::Int(value))
        }
        ParamType::OrderedInt | ParamType::Categorical | ParamType::Bool => {
            pick_option(spec, range, options, u)
        }
        ParamType::List => {
            if !options.is_empty() {
                return pick_option(spec, range, options, u);
            }
            if range.is_empty() || !range.is_finite() {
                return Err(empty_domain(spec, "unusable element range"));
            }
            let element = ParameterValue::Float(project_float(range, u));
            Ok(ParameterValue::List(vec![element; list_len(spec)]))
        }
    }
}

/// Draw a random valid value of `spec`.
pub fn sample_value<R: Rng + ?Sized>(
    spec: &ParameterSpec,
    range: &ResolvedRange,
    options: &[ParameterValue],
    rng: &mut R,
) -> HwResult<ParameterValue> {
    if spec.value_type == ParamType::List && options.is_empty() {
        if range.is_empty() || !range.is_finite() {
            return Err(empty_domain(spec, "unusable element range"));
        }
        let items = (0..list_len(spec))
            .map(|_| ParameterValue::Float(project_float(range, rng.random::<f64>())))
            .collect();
        return Ok(ParameterValue::List(items));
    }
    project_value(spec, range, options, rng.random::<f64>())
}

/// Inverse of [`project_value`]: the unit coordinate a value occupies. Used to
/// place observed assignments in the surrogate's input space.
pub fn encode_value(
    spec: &ParameterSpec,
    range: &ResolvedRange,
    options: &[ParameterValue],
    value: &ParameterValue,
) -> f64 {
    let unit = |x: f64, lo: f64, hi: f64| {
        if hi > lo {
            ((x - lo) / (hi - lo)).clamp(0.0, 1.0)
        } else {
            0.5
        }
    };
    let option_position = |value: &ParameterValue| {
        let admissible = admissible_options(spec, range, options);
        admissible
            .iter()
            .position(|o| *o == value)
            .map(|idx| (idx as f64 + 0.5) / admissible.len() as f64)
            .unwrap_or(0.5)
    };

    match (spec.value_type, value) {
        (ParamType::OrderedInt | ParamType::Categorical | ParamType::Bool, v) => option_position(v),
        (ParamType::List, v) if !options.is_empty() => option_position(v),
        (ParamType::List, ParameterValue::List(items)) => items
            .first()
            .and_then(ParameterValue::as_f64)
            .map(|x| encode_float(range, x))
            .unwrap_or(0.5),
        (ParamType::Int, v) => match (range.int_bounds(), v.as_f64()) {
            (Some((lo, hi)), Some(x)) => unit(x, lo as f64, hi as f64),
            _ => 0.5,
        },
        (_, v) => v.as_f64().map(|x| encode_float(range, x)).unwrap_or(0.5),
    }
}

fn encode_float(range: &ResolvedRange, x: f64) -> f64 {
    if range.log_scaled() && x > 0.0 {
        let (lo, hi) = (range.lo.ln(), range.hi.ln());
        ((x.ln() - lo) / (hi - lo)).clamp(0.0, 1.0)
    } else if range.hi > range.lo {
        ((x - range.lo) / (range.hi - range.lo)).clamp(0.0, 1.0)
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn parents(pairs: &[(&str, f64)]) -> ParameterAssignment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ParameterValue::Float(*v)))
            .collect()
    }

    #[test]
    fn override_replaces_schema_bounds() {
        let spec = ParameterSpec::float("lr", 0.0, 1.0);
        let mut overrides = CustomRanges::new();
        overrides.insert("lr".into(), CustomRangeOverride::range(Some(0.001), Some(0.01)));

        let range = resolve_range(&spec, &ParameterAssignment::new(), &overrides);
        assert_eq!(range, ResolvedRange::closed(0.001, 0.01));
    }

    #[test]
    fn infinite_bounds_fall_back_to_default() {
        let spec = ParameterSpec::float("momentum", f64::NEG_INFINITY, 1.0).with_default(0.9);
        let range = resolve_range(&spec, &ParameterAssignment::new(), &CustomRanges::new());
        assert_eq!(range.lo, 0.9);
        assert_eq!(range.hi, 1.0);
    }

    #[test]
    fn less_than_dependency_caps_upper_bound() {
        let spec = ParameterSpec::float("b", 0.0, 10.0).with_dependency(Comparator::Lt, "a");
        let range = resolve_range(&spec, &parents(&[("a", 8.0)]), &CustomRanges::new());
        assert_eq!(range.hi, 8.0);
        assert!(!range.hi_inclusive);
        assert!(!range.contains(8.0));
        assert!(range.contains(7.99));
    }

    #[test]
    fn greater_equal_dependency_raises_lower_bound() {
        let spec = ParameterSpec::float("max_lr", 0.0, 1.0).with_dependency(Comparator::Ge, "min_lr");
        let range = resolve_range(&spec, &parents(&[("min_lr", 0.2)]), &CustomRanges::new());
        assert_eq!(range.lo, 0.2);
        assert!(range.lo_inclusive);
    }

    #[test]
    fn missing_parent_uses_default_range() {
        let spec = ParameterSpec::float("b", 0.0, 10.0).with_dependency(Comparator::Lt, "a");
        let range = resolve_range(&spec, &ParameterAssignment::new(), &CustomRanges::new());
        assert_eq!(range, ResolvedRange::closed(0.0, 10.0));
    }

    #[test]
    fn override_can_replace_dependency() {
        let spec = ParameterSpec::float("b", 0.0, 10.0).with_dependency(Comparator::Lt, "a");
        let mut overrides = CustomRanges::new();
        overrides.insert(
            "b".into(),
            CustomRangeOverride {
                depends_on: Some(Dependency::new(Comparator::Gt, "c")),
                ..CustomRangeOverride::default()
            },
        );
        let range = resolve_range(&spec, &parents(&[("a", 8.0), ("c", 3.0)]), &overrides);
        assert_eq!(range.lo, 3.0);
        assert!(!range.lo_inclusive);
        assert_eq!(range.hi, 10.0);
    }

    #[test]
    fn dependency_that_empties_range_is_ignored() {
        let spec = ParameterSpec::int("b", 5, 10).with_dependency(Comparator::Lt, "a");
        let range = resolve_range(&spec, &parents(&[("a", 5.0)]), &CustomRanges::new());
        assert_eq!(range, ResolvedRange::closed(5.0, 10.0));
    }

    #[test]
    fn options_override_or_fall_back() {
        let spec = ParameterSpec::categorical("optimizer", vec!["sgd".into(), "adam".into()]);
        let mut overrides = CustomRanges::new();
        assert_eq!(resolve_options(&spec, &overrides).len(), 2);

        overrides.insert("optimizer".into(), CustomRangeOverride::options(vec![]));
        assert_eq!(resolve_options(&spec, &overrides).len(), 2);

        overrides.insert("optimizer".into(), CustomRangeOverride::options(vec!["adamw".into()]));
        assert_eq!(resolve_options(&spec, &overrides), vec![ParameterValue::from("adamw")]);
    }

    #[test]
    fn clamp_keeps_exclusive_bounds_open() {
        let range = ResolvedRange {
            lo: 1.0,
            hi: 10.0,
            lo_inclusive: false,
            hi_inclusive: false,
        };
        let high = clamp_value(15.0, &range);
        assert!(high < 10.0 && high > 9.9);
        let low = clamp_value(-3.0, &range);
        assert!(low > 1.0 && low < 1.1);
        assert_eq!(clamp_value(4.0, &range), 4.0);
        assert_eq!(clamp_value(12.0, &ResolvedRange::closed(1.0, 10.0)), 10.0);
    }

    #[test]
    fn input_dimension_rounds_to_nearest_multiple() {
        assert_eq!(fix_input_dimension(50, 32), 64);
        assert_eq!(fix_input_dimension(64, 32), 64);
        assert_eq!(fix_input_dimension(70, 32), 64);
        assert_eq!(fix_input_dimension(10, 32), 32);
    }

    #[test]
    fn power_of_factor_rounds_to_nearest_power() {
        assert_eq!(fix_power_of_factor(8, 2), 8);
        assert_eq!(fix_power_of_factor(10, 2), 8);
        assert_eq!(fix_power_of_factor(12, 2), 16);
        assert_eq!(fix_power_of_factor(0, 2), 2);
        assert_eq!(fix_power_of_factor(-5, 2), 2);
    }

    #[test]
    fn math_cond_respects_range() {
        // Nearest multiple (96) is above hi; largest multiple below hi wins.
        assert_eq!(apply_math_cond(90, MathCond::MultipleOf(32), 0, 80), 64);
        // Nothing satisfies the condition inside [65, 80]: closest boundary.
        assert_eq!(apply_math_cond(70, MathCond::MultipleOf(32), 65, 80), 65);
        assert_eq!(apply_math_cond(3, MathCond::PowerOf(2), 5, 100), 8);
    }

    #[test]
    fn int_projection_honors_math_cond_and_bounds() {
        let spec = ParameterSpec::int("batch", 16, 256).with_math_cond(MathCond::PowerOf(2));
        let range = resolve_range(&spec, &ParameterAssignment::new(), &CustomRanges::new());
        for u in [0.0, 0.13, 0.5, 0.77, 1.0] {
            let v = project_value(&spec, &range, &[], u).unwrap().as_i64().unwrap();
            assert!((16..=256).contains(&v));
            assert_eq!(v & (v - 1), 0, "{v} is not a power of two");
        }
    }

    #[test]
    fn samples_stay_in_exclusive_range() {
        let spec = ParameterSpec::float("b", 0.0, 10.0).with_dependency(Comparator::Lt, "a");
        let range = resolve_range(&spec, &parents(&[("a", 8.0)]), &CustomRanges::new());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let v = sample_value(&spec, &range, &[], &mut rng).unwrap().as_f64().unwrap();
            assert!(range.contains(v), "{v} escaped {range:?}");
        }
        assert!(range.contains(project_value(&spec, &range, &[], 1.0).unwrap().as_f64().unwrap()));
    }

    #[test]
    fn ordered_int_options_narrowed_by_dependency() {
        let spec =
            ParameterSpec::ordered_int("layers", vec![18, 34, 50, 101]).with_dependency(Comparator::Le, "cap");
        let options = resolve_options(&spec, &CustomRanges::new());
        let range = resolve_range(&spec, &parents(&[("cap", 50.0)]), &CustomRanges::new());
        for u in [0.0, 0.5, 0.99] {
            let v = project_value(&spec, &range, &options, u).unwrap().as_i64().unwrap();
            assert!(v <= 50);
        }
    }

    #[test]
    fn encode_inverts_projection_for_options() {
        let spec = ParameterSpec::categorical("opt", vec!["sgd".into(), "adam".into(), "lamb".into()]);
        let options = resolve_options(&spec, &CustomRanges::new());
        let range = resolve_range(&spec, &ParameterAssignment::new(), &CustomRanges::new());
        for value in &options {
            let u = encode_value(&spec, &range, &options, value);
            assert_eq!(&project_value(&spec, &range, &options, u).unwrap(), value);
        }
    }

    #[test]
    fn log_scale_used_for_wide_positive_ranges() {
        let spec = ParameterSpec::float("lr", 1e-5, 1e-1);
        let range = resolve_range(&spec, &ParameterAssignment::new(), &CustomRanges::new());
        let mid = project_value(&spec, &range, &[], 0.5).unwrap().as_f64().unwrap();
        assert!((mid - 1e-3).abs() < 1e-9);
        assert!((encode_value(&spec, &range, &[], &ParameterValue::Float(1e-3)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn int_projection_spans_full_i64_range() {
        let spec = ParameterSpec::int("seed", i64::MIN, i64::MAX);
        let range = resolve_range(&spec, &ParameterAssignment::new(), &CustomRanges::new());
        assert_eq!(
            project_value(&spec, &range, &[], 0.0).unwrap(),
            ParameterValue::Int(i64::MIN)
        );
        assert_eq!(
            project_value(&spec, &range, &[], 1.0).unwrap(),
            ParameterValue::Int(i64::MAX)
        );
        let mid = project_value(&spec, &range, &[], 0.5).unwrap().as_f64().unwrap();
        assert!(mid.abs() < 1e6);
    }

    #[test]
    fn empty_options_is_an_error() {
        let spec = ParameterSpec::categorical("opt", vec![]);
        let range = ResolvedRange::closed(0.0, 0.0);
        assert!(project_value(&spec, &range, &[], 0.3).is_err());
    }
}
