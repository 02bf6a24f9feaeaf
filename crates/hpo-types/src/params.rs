//! Numeric hyperparameter model: values, distributions and declarations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ConfigError, TrialError};

/// A concrete parameter value, either sampled or fixed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
}

impl ParameterValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) => None,
        }
    }

    pub fn kind(&self) -> NumericKind {
        match self {
            Self::Int(_) => NumericKind::Int,
            Self::Float(_) => NumericKind::Float,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Resolved parameter mapping for one trial.
pub type ParamMap = BTreeMap<String, ParameterValue>;

/// Which suggestion call a parameter is drawn with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericKind {
    Int,
    Float,
}

impl std::fmt::Display for NumericKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
        }
    }
}

/// Range a parameter is suggested from. The numeric kind is part of the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// Integer range [low, high] inclusive on the `step` lattice.
    Int { low: i64, high: i64, step: i64, log: bool },
    /// Real range [low, high], optionally discretized by `step`.
    Float {
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    },
}

impl Distribution {
    pub fn kind(&self) -> NumericKind {
        match self {
            Self::Int { .. } => NumericKind::Int,
            Self::Float { .. } => NumericKind::Float,
        }
    }

    pub fn is_log(&self) -> bool {
        match self {
            Self::Int { log, .. } | Self::Float { log, .. } => *log,
        }
    }

    /// Check bounds and snap `high` onto the step lattice.
    pub fn normalized(&self, name: &str) -> Result<Self, TrialError> {
        let invalid = |message: &str| TrialError::InvalidDistribution {
            name: name.to_string(),
            message: message.to_string(),
        };

        match *self {
            Self::Int {
                low,
                high,
                step,
                log,
            } => {
                if low > high {
                    return Err(invalid("low is greater than high"));
                }
                if step <= 0 {
                    return Err(invalid("step must be positive"));
                }
                if log && step != 1 {
                    return Err(invalid("log scale cannot be combined with a step"));
                }
                if log && low < 1 {
                    return Err(invalid("log scale requires low >= 1"));
                }
                let high = low + ((high - low) / step) * step;
                Ok(Self::Int {
                    low,
                    high,
                    step,
                    log,
                })
            }
            Self::Float {
                low,
                high,
                step,
                log,
            } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid("bounds must be finite"));
                }
                if low > high {
                    return Err(invalid("low is greater than high"));
                }
                if log && step.is_some() {
                    return Err(invalid("log scale cannot be combined with a step"));
                }
                if log && low <= 0.0 {
                    return Err(invalid("log scale requires low > 0"));
                }
                let high = match step {
                    Some(s) if s <= 0.0 => return Err(invalid("step must be positive")),
                    Some(s) => low + ((high - low) / s + 1e-9).floor() * s,
                    None => high,
                };
                Ok(Self::Float {
                    low,
                    high,
                    step,
                    log,
                })
            }
        }
    }

    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (self, value) {
            (Self::Int { low, high, step, .. }, ParameterValue::Int(v)) => {
                v >= low && v <= high && (v - low) % step == 0
            }
            (Self::Float { low, high, .. }, ParameterValue::Float(v)) => v >= low && v <= high,
            _ => false,
        }
    }

    /// Map a value of this distribution onto [0, 1], in log space when the
    /// distribution is log scaled.
    pub fn to_unit(&self, value: &ParameterValue) -> f64 {
        let (low, high) = self.bounds();
        let v = value.as_f64();
        let (low, high, v) = if self.is_log() {
            (low.ln(), high.ln(), v.max(f64::MIN_POSITIVE).ln())
        } else {
            (low, high, v)
        };
        if high <= low {
            return 0.5;
        }
        ((v - low) / (high - low)).clamp(0.0, 1.0)
    }

    /// Inverse of [`Distribution::to_unit`], rounding onto the step lattice.
    pub fn from_unit(&self, u: f64) -> ParameterValue {
        let u = u.clamp(0.0, 1.0);
        let (low, high) = self.bounds();
        let raw = if self.is_log() {
            (low.ln() + u * (high.ln() - low.ln())).exp()
        } else {
            low + u * (high - low)
        };

        match *self {
            Self::Int {
                low, high, step, ..
            } => {
                let steps = ((raw - low as f64) / step as f64).round() as i64;
                ParameterValue::Int((low + steps * step).clamp(low, high))
            }
            Self::Float {
                low, high, step, ..
            } => {
                let v = match step {
                    Some(s) => low + ((raw - low) / s).round() * s,
                    None => raw,
                };
                ParameterValue::Float(v.clamp(low, high))
            }
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        match self {
            Self::Int { low, high, .. } => (*low as f64, *high as f64),
            Self::Float { low, high, .. } => (*low, *high),
        }
    }
}

/// Declaration of one tunable hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub distribution: Distribution,
}

impl ParameterSpec {
    pub fn int(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self::int_step(name, low, high, 1)
    }

    pub fn int_step(name: impl Into<String>, low: i64, high: i64, step: i64) -> Self {
        Self {
            name: name.into(),
            distribution: Distribution::Int {
                low,
                high,
                step,
                log: false,
            },
        }
    }

    pub fn float(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            distribution: Distribution::Float {
                low,
                high,
                step: None,
                log: false,
            },
        }
    }

    pub fn float_step(name: impl Into<String>, low: f64, high: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            distribution: Distribution::Float {
                low,
                high,
                step: Some(step),
                log: false,
            },
        }
    }

    pub fn log_scale(mut self) -> Self {
        match &mut self.distribution {
            Distribution::Int { log, .. } | Distribution::Float { log, .. } => *log = true,
        }
        self
    }

    pub fn kind(&self) -> NumericKind {
        self.distribution.kind()
    }

    /// Declare a parameter from loosely typed bounds (e.g. a JSON search
    /// space file). The kind is taken from `low`: an integer number gives an
    /// integer parameter, any other number a real one.
    pub fn from_bounds(
        name: impl Into<String>,
        low: &serde_json::Value,
        high: &serde_json::Value,
        step: Option<&serde_json::Value>,
        log: bool,
    ) -> Result<Self, TrialError> {
        let name = name.into();
        let unsupported = |v: &serde_json::Value| TrialError::UnsupportedParameterKind {
            name: name.clone(),
            found: json_kind(v).to_string(),
        };

        let distribution = if let Some(low) = low.as_i64().filter(|_| !low.is_f64()) {
            let high = high.as_i64().ok_or_else(|| unsupported(high))?;
            let step = match step {
                Some(s) => s.as_i64().ok_or_else(|| unsupported(s))?,
                None => 1,
            };
            Distribution::Int {
                low,
                high,
                step,
                log,
            }
        } else if let Some(low) = low.as_f64() {
            let high = high.as_f64().ok_or_else(|| unsupported(high))?;
            let step = match step {
                Some(s) => Some(s.as_f64().ok_or_else(|| unsupported(s))?),
                None => None,
            };
            Distribution::Float {
                low,
                high,
                step,
                log,
            }
        } else {
            return Err(unsupported(low));
        };

        let distribution = distribution.normalized(&name)?;
        Ok(Self { name, distribution })
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Parse `name=value` pairs separated by commas into fixed overrides.
/// Values that parse as integers become `Int`, other numbers `Float`.
pub fn parse_param_overrides(input: &str) -> Result<ParamMap, ConfigError> {
    let mut params = ParamMap::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, raw) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: pair.to_string(),
            message: "expected name=value".to_string(),
        })?;
        let (name, raw) = (name.trim(), raw.trim());
        let value = parse_value(raw).ok_or_else(|| ConfigError::InvalidValue {
            key: name.to_string(),
            message: format!("{raw:?} is not a number"),
        })?;
        params.insert(name.to_string(), value);
    }
    Ok(params)
}

pub fn parse_value(raw: &str) -> Option<ParameterValue> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(ParameterValue::Int(v));
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(ParameterValue::Float)
}
