//! Parameter schema types and concrete parameter values.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::errors::HwError;

/// Value type of a tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Float,
    Int,
    /// Integer drawn from an ordered option list (e.g. layer counts).
    OrderedInt,
    Categorical,
    Bool,
    List,
}

impl ParamType {
    /// Whether values are generated from `[valid_min, valid_max]` rather than
    /// from an option list.
    pub fn is_numeric_range(&self) -> bool {
        matches!(self, ParamType::Float | ParamType::Int)
    }
}

/// A concrete parameter value produced by a search algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ParameterValue>),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// One full set of parameter values for a trial, keyed by parameter name.
pub type ParameterAssignment = BTreeMap<String, ParameterValue>;

/// Comparator used by a dependency between two parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
        }
    }
}

impl FromStr for Comparator {
    type Err = HwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Comparator::Gt),
            ">=" => Ok(Comparator::Ge),
            "<" => Ok(Comparator::Lt),
            "<=" => Ok(Comparator::Le),
            other => Err(HwError::Configuration(format!(
                "unknown dependency comparator '{other}'"
            ))),
        }
    }
}

/// `value <comparator> parent`. For example `"< max_lr"` constrains a parameter to be
/// strictly below the current value of `max_lr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dependency {
    pub comparator: Comparator,
    pub parent_param: String,
}

impl Dependency {
    pub fn new(comparator: Comparator, parent_param: impl Into<String>) -> Self {
        Self {
            comparator,
            parent_param: parent_param.into(),
        }
    }
}

impl FromStr for Dependency {
    type Err = HwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(op), Some(parent), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(HwError::Configuration(format!(
                "dependency '{s}' must look like '<op> <parent_param>'"
            )));
        };
        Ok(Self::new(op.parse()?, parent))
    }
}

impl TryFrom<String> for Dependency {
    type Error = HwError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Dependency> for String {
    fn from(dep: Dependency) -> Self {
        dep.to_string()
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.comparator.symbol(), self.parent_param)
    }
}

/// Secondary numeric constraint on an integer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MathCond {
    /// `"% N"`: value must be a multiple of N.
    MultipleOf(i64),
    /// `"^ N"`: value must be a power of N.
    PowerOf(i64),
}

impl FromStr for MathCond {
    type Err = HwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(op), Some(factor), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(HwError::Configuration(format!("malformed math condition '{s}'")));
        };
        let factor: i64 = factor
            .parse()
            .map_err(|_| HwError::Configuration(format!("malformed math condition '{s}'")))?;
        if factor < 2 {
            return Err(HwError::Configuration(format!(
                "math condition factor must be >= 2, got {factor}"
            )));
        }
        match op {
            "%" => Ok(MathCond::MultipleOf(factor)),
            "^" => Ok(MathCond::PowerOf(factor)),
            _ => Err(HwError::Configuration(format!("unknown math condition '{s}'"))),
        }
    }
}

impl TryFrom<String> for MathCond {
    type Error = HwError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MathCond> for String {
    fn from(cond: MathCond) -> Self {
        match cond {
            MathCond::MultipleOf(n) => format!("% {n}"),
            MathCond::PowerOf(n) => format!("^ {n}"),
        }
    }
}

/// Schema description of one tunable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Dotted parameter path (e.g. "train.learning_rate").
    pub name: String,
    pub value_type: ParamType,
    /// Lower bound; may be `-inf` in the schema.
    pub valid_min: f64,
    /// Upper bound; may be `+inf` in the schema.
    pub valid_max: f64,
    pub default_value: Option<ParameterValue>,
    #[serde(default)]
    pub valid_options: Vec<ParameterValue>,
    #[serde(default)]
    pub depends_on: Option<Dependency>,
    #[serde(default)]
    pub math_cond: Option<MathCond>,
}

impl ParameterSpec {
    fn base(name: impl Into<String>, value_type: ParamType) -> Self {
        Self {
            name: name.into(),
            value_type,
            valid_min: f64::NEG_INFINITY,
            valid_max: f64::INFINITY,
            default_value: None,
            valid_options: Vec::new(),
            depends_on: None,
            math_cond: None,
        }
    }

    pub fn float(name: impl Into<String>, valid_min: f64, valid_max: f64) -> Self {
        Self {
            valid_min,
            valid_max,
            ..Self::base(name, ParamType::Float)
        }
    }

    pub fn int(name: impl Into<String>, valid_min: i64, valid_max: i64) -> Self {
        Self {
            valid_min: valid_min as f64,
            valid_max: valid_max as f64,
            ..Self::base(name, ParamType::Int)
        }
    }

    pub fn ordered_int(name: impl Into<String>, options: Vec<i64>) -> Self {
        Self {
            valid_options: options.into_iter().map(ParameterValue::Int).collect(),
            ..Self::base(name, ParamType::OrderedInt)
        }
    }

    pub fn categorical(name: impl Into<String>, options: Vec<ParameterValue>) -> Self {
        Self {
            valid_options: options,
            ..Self::base(name, ParamType::Categorical)
        }
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self {
            valid_options: vec![ParameterValue::Bool(false), ParameterValue::Bool(true)],
            ..Self::base(name, ParamType::Bool)
        }
    }

    /// A list-valued parameter (e.g. optimizer betas). Each element is drawn
    /// from `[valid_min, valid_max]`; the length follows `default_value`.
    pub fn list(name: impl Into<String>, valid_min: f64, valid_max: f64, default: Vec<f64>) -> Self {
        Self {
            valid_min,
            valid_max,
            default_value: Some(ParameterValue::List(
                default.into_iter().map(ParameterValue::Float).collect(),
            )),
            ..Self::base(name, ParamType::List)
        }
    }

    pub fn with_default(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_dependency(mut self, comparator: Comparator, parent: impl Into<String>) -> Self {
        self.depends_on = Some(Dependency::new(comparator, parent));
        self
    }

    pub fn with_math_cond(mut self, cond: MathCond) -> Self {
        self.math_cond = Some(cond);
        self
    }

    /// Numeric default, used to replace infinite schema bounds.
    pub fn default_f64(&self) -> Option<f64> {
        self.default_value.as_ref().and_then(ParameterValue::as_f64)
    }
}

/// Per-experiment override of a parameter's schema bounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomRangeOverride {
    #[serde(default)]
    pub valid_min: Option<f64>,
    #[serde(default)]
    pub valid_max: Option<f64>,
    #[serde(default)]
    pub valid_options: Option<Vec<ParameterValue>>,
    #[serde(default)]
    pub depends_on: Option<Dependency>,
}

impl CustomRangeOverride {
    pub fn range(valid_min: Option<f64>, valid_max: Option<f64>) -> Self {
        Self {
            valid_min,
            valid_max,
            ..Self::default()
        }
    }

    pub fn options(options: Vec<ParameterValue>) -> Self {
        Self {
            valid_options: Some(options),
            ..Self::default()
        }
    }
}

/// Sparse mapping parameter name → override. Absent entries use schema defaults.
pub type CustomRanges = HashMap<String, CustomRangeOverride>;
