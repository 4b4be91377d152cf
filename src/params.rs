//! Parameter metadata for detectors
//!
//! Exposes every tunable of the range, manipulation, trendline and level
//! detectors as name / default / search range, so callers can run parameter
//! sweeps or build a settings screen without knowing the structs.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//!
//! use rangehunter::params::ParameterizedDetector;
//! use rangehunter::prelude::*;
//!
//! for param in RangeDetector::param_meta() {
//!   println!("{}: {:?} (default: {})", param.name, param.param_type, param.default);
//! }
//!
//! let mut params = HashMap::new();
//! params.insert("min_bounces", 2.0);
//! let detector = RangeDetector::with_params(&params).unwrap();
//! assert_eq!(detector.min_bounces, 2);
//! ```

use std::collections::HashMap;

use crate::detectors::{BreakoutTrigger, LevelDetector, ManipulationDetector, RangeDetector, TrendlineFitter};
use crate::{AnalysisError, Period, Ratio, Result};

// ============================================================
// PARAMETER TYPES
// ============================================================

/// Type of parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
  /// Fraction in 0.0..=1.0
  Ratio,
  /// Bar count (positive integer)
  Period,
  /// Non-negative integer count
  Count,
  /// Unconstrained positive float
  Float,
}

/// Metadata for a single detector parameter
#[derive(Debug, Clone)]
pub struct ParamMeta {
  /// Parameter name, identical to the config field
  pub name: &'static str,
  pub param_type: ParamType,
  pub default: f64,
  /// Range for optimization: (min, max, step)
  pub range: (f64, f64, f64),
  pub description: &'static str,
}

impl ParamMeta {
  pub const fn ratio(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Ratio, default, range, description }
  }

  pub const fn period(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Period, default, range, description }
  }

  pub const fn count(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Count, default, range, description }
  }

  pub const fn float(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Float, default, range, description }
  }

  /// Generate all values for grid search
  pub fn generate_grid(&self) -> Vec<f64> {
    let (min, max, step) = self.range;
    let mut values = Vec::new();
    let mut k = 0u32;
    loop {
      // step counting avoids accumulating float error
      let v = min + step * k as f64;
      if v > max + 1e-9 {
        break;
      }
      values.push(v);
      k += 1;
    }
    values
  }

  /// Validate a value for this parameter
  pub fn validate(&self, value: f64) -> Result<()> {
    let (min, max, _) = self.range;
    if !value.is_finite() {
      return Err(AnalysisError::InvalidValue("parameter cannot be NaN or infinite"));
    }
    if value < min || value > max {
      return Err(AnalysisError::OutOfRange { field: self.name, value, min, max });
    }
    match self.param_type {
      ParamType::Ratio | ParamType::Float => Ok(()),
      ParamType::Period | ParamType::Count => {
        if value.fract() != 0.0 {
          return Err(AnalysisError::InvalidValue("Period/count must be an integer"));
        }
        Ok(())
      },
    }
  }
}

// ============================================================
// PARAMETERIZED DETECTOR TRAIT
// ============================================================

/// Detectors whose tunables can be listed and set by name
pub trait ParameterizedDetector: Sized {
  /// Returns metadata for all configurable parameters
  fn param_meta() -> &'static [ParamMeta];

  /// Creates a detector with parameters from a HashMap
  ///
  /// Missing parameters use their default values. Unknown names and values
  /// outside the search range are rejected.
  fn with_params(params: &HashMap<&str, f64>) -> Result<Self>;

  /// Stable detector name, used in logs and sweep output
  fn detector_name() -> &'static str;
}

/// Reject unknown keys and out-of-range values against `meta`.
pub fn check_params(meta: &[ParamMeta], params: &HashMap<&str, f64>) -> Result<()> {
  for (&key, &value) in params {
    let Some(m) = meta.iter().find(|m| m.name == key) else {
      return Err(AnalysisError::InvalidConfig(format!("unknown parameter: {key}")));
    };
    m.validate(value)?;
  }
  Ok(())
}

// ============================================================
// PARAMETER VALUE HELPERS
// ============================================================

/// Helper to get a Ratio from params with default fallback
pub fn get_ratio(params: &HashMap<&str, f64>, key: &str, default: f64) -> Result<Ratio> {
  let value = params.get(key).copied().unwrap_or(default);
  Ratio::new(value)
}

/// Helper to get a Period from params with default fallback
pub fn get_period(params: &HashMap<&str, f64>, key: &str, default: usize) -> Result<Period> {
  let value = params.get(key).copied().unwrap_or(default as f64);
  Period::new(value as usize)
}

pub fn get_count(params: &HashMap<&str, f64>, key: &str, default: usize) -> usize {
  params.get(key).map(|&v| v as usize).unwrap_or(default)
}

pub fn get_float(params: &HashMap<&str, f64>, key: &str, default: f64) -> f64 {
  params.get(key).copied().unwrap_or(default)
}

// ============================================================
// DETECTOR IMPLEMENTATIONS
// ============================================================

static RANGE_PARAMS: [ParamMeta; 4] = [
  ParamMeta::period("window", 50.0, (10.0, 200.0, 10.0), "Trailing bars forming the box"),
  ParamMeta::float("atr_multiplier", 3.0, (1.0, 6.0, 0.5), "Box is tight below ATR x multiplier"),
  ParamMeta::ratio("tolerance_pct", 0.02, (0.01, 0.1, 0.01), "Touch tolerance as fraction of width"),
  ParamMeta::count("min_bounces", 3.0, (1.0, 6.0, 1.0), "Wick touches required on each edge"),
];

impl ParameterizedDetector for RangeDetector {
  fn param_meta() -> &'static [ParamMeta] {
    &RANGE_PARAMS
  }

  fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
    check_params(Self::param_meta(), params)?;
    let d = Self::default();
    let detector = Self {
      window: get_period(params, "window", d.window.get())?,
      atr_multiplier: get_float(params, "atr_multiplier", d.atr_multiplier),
      tolerance_pct: get_ratio(params, "tolerance_pct", d.tolerance_pct.get())?,
      min_bounces: get_count(params, "min_bounces", d.min_bounces),
    };
    detector.validate_config()?;
    Ok(detector)
  }

  fn detector_name() -> &'static str {
    "range"
  }
}

static MANIPULATION_PARAMS: [ParamMeta; 2] = [
  ParamMeta::period("lookback", 300.0, (50.0, 500.0, 50.0), "Trailing bars scanned for breakouts"),
  ParamMeta::count("close_trigger", 0.0, (0.0, 1.0, 1.0), "1 opens breakouts on closes, 0 on wicks"),
];

impl ParameterizedDetector for ManipulationDetector {
  fn param_meta() -> &'static [ParamMeta] {
    &MANIPULATION_PARAMS
  }

  fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
    check_params(Self::param_meta(), params)?;
    let d = Self::default();
    let trigger = if get_count(params, "close_trigger", 0) == 1 {
      BreakoutTrigger::Close
    } else {
      BreakoutTrigger::Wick
    };
    let detector = Self { lookback: get_period(params, "lookback", d.lookback.get())?, trigger };
    detector.validate_config()?;
    Ok(detector)
  }

  fn detector_name() -> &'static str {
    "manipulation"
  }
}

static TRENDLINE_PARAMS: [ParamMeta; 5] = [
  ParamMeta::count("min_points", 3.0, (3.0, 8.0, 1.0), "Minimum inlier pivots behind a line"),
  ParamMeta::ratio("min_correlation", 0.85, (0.7, 0.95, 0.05), "Minimum |r| of the inliers"),
  ParamMeta::ratio("dominance", 0.70, (0.6, 0.9, 0.05), "Share of closes on one side settling the role"),
  ParamMeta::ratio("flip_threshold", 0.40, (0.3, 0.6, 0.05), "Share of closes needed to flip the role"),
  ParamMeta::count("max_samples", 1024.0, (256.0, 4096.0, 256.0), "Pivot pairs scored per candidate line"),
];

impl ParameterizedDetector for TrendlineFitter {
  fn param_meta() -> &'static [ParamMeta] {
    &TRENDLINE_PARAMS
  }

  fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
    check_params(Self::param_meta(), params)?;
    let d = Self::default();
    let fitter = Self {
      min_points: get_count(params, "min_points", d.min_points),
      min_correlation: get_ratio(params, "min_correlation", d.min_correlation.get())?,
      dominance: get_ratio(params, "dominance", d.dominance.get())?,
      flip_threshold: get_ratio(params, "flip_threshold", d.flip_threshold.get())?,
      max_samples: get_count(params, "max_samples", d.max_samples),
      ..d
    };
    fitter.validate_config()?;
    Ok(fitter)
  }

  fn detector_name() -> &'static str {
    "trendline"
  }
}

static LEVEL_PARAMS: [ParamMeta; 2] = [
  ParamMeta::period("window", 20.0, (10.0, 50.0, 5.0), "Bars per rolling window"),
  ParamMeta::float("tolerance", 0.002, (0.001, 0.01, 0.001), "Relative distance merging two levels"),
];

impl ParameterizedDetector for LevelDetector {
  fn param_meta() -> &'static [ParamMeta] {
    &LEVEL_PARAMS
  }

  fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
    check_params(Self::param_meta(), params)?;
    let d = Self::default();
    let detector = Self {
      window: get_period(params, "window", d.window.get())?,
      tolerance: get_float(params, "tolerance", d.tolerance),
    };
    detector.validate_config()?;
    Ok(detector)
  }

  fn detector_name() -> &'static str {
    "levels"
  }
}

// ============================================================
// TESTS
// ============================================================
