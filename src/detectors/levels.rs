//! Horizontal support / resistance levels from rolling body extremes

use super::helpers::round2;
use crate::{AnalysisError, OHLCVExt, Period, Result, OHLCV};

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KeyLevels {
    pub support: Vec<f64>,
    pub resistance: Vec<f64>,
}

/// Level detector configuration
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LevelDetector {
    /// Bars per rolling window
    pub window: Period,
    /// Relative distance under which two levels are the same level
    pub tolerance: f64,
}

impl Default for LevelDetector {
    fn default() -> Self {
        Self {
            window: Period::new_const(20),
            tolerance: 0.002,
        }
    }
}

/// True when `level` is within `tolerance` (relative) of an existing entry.
/// A zero-priced entry only matches an identical level.
fn near_existing(existing: &[f64], level: f64, tolerance: f64) -> bool {
    existing.iter().any(|&e| {
        if e.abs() <= f64::EPSILON {
            (level - e).abs() <= f64::EPSILON
        } else {
            ((level - e) / e).abs() < tolerance
        }
    })
}

impl LevelDetector {
    pub fn validate_config(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(AnalysisError::OutOfRange {
                field: "tolerance",
                value: self.tolerance,
                min: 0.0,
                max: f64::MAX,
            });
        }
        Ok(())
    }

    /// For every window ending before bar `i`, record its max body high as
    /// resistance and min body low as support, skipping near-duplicates.
    pub fn detect<T: OHLCV>(&self, bars: &[T]) -> KeyLevels {
        let window = self.window.get();
        let mut levels = KeyLevels::default();

        for end in window..bars.len() {
            let slice = &bars[end - window..end];
            let high = slice.iter().map(|b| b.body_high()).fold(f64::NEG_INFINITY, f64::max);
            let low = slice.iter().map(|b| b.body_low()).fold(f64::INFINITY, f64::min);

            if !near_existing(&levels.resistance, high, self.tolerance) {
                levels.resistance.push(round2(high));
            }
            if !near_existing(&levels.support, low, self.tolerance) {
                levels.support.push(round2(low));
            }
        }

        levels
    }
}
