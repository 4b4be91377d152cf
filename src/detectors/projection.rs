//! Fibonacci retracement / target projection
//!
//! Projects against the manipulation: a breakout up that returned projects
//! down from the range, a breakout down projects up. For every ratio,
//! `price = anchor0 + (anchor1 - anchor0) * ratio`.

use super::helpers::round2;
use super::range::Range;
use crate::{BreakoutDirection, Detection, NotFoundReason};

/// Every projected ratio, from the far anchor to the last target
pub const FIB_RATIOS: [f64; 9] = [1.0, 0.786, 0.707, 0.618, 0.5, 0.0, -0.236, -0.618, -1.0];

/// Ratios forming the retracement (entry) zone
pub const RETRACEMENT_RATIOS: [f64; 3] = [0.618, 0.707, 0.786];

/// Ratios used as profit targets
pub const TARGET_RATIOS: [f64; 4] = [0.0, -0.236, -0.618, -1.0];

/// One projected level
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FibLevel {
    pub ratio: f64,
    /// Display label, e.g. "0.618"
    pub label: String,
    /// Exact `anchor0 + (anchor1 - anchor0) * ratio`
    pub price: f64,
}

impl FibLevel {
    /// Price at display precision (2 dp)
    #[inline]
    pub fn rounded(&self) -> f64 {
        round2(self.price)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FibProjection {
    pub anchor0: f64,
    pub anchor1: f64,
    /// Where targets head: opposite to the manipulation
    pub direction: BreakoutDirection,
    /// All levels in [`FIB_RATIOS`] order
    pub levels: Vec<FibLevel>,
    pub message: String,
}

impl FibProjection {
    /// Level for an exact configured ratio
    pub fn level(&self, ratio: f64) -> Option<&FibLevel> {
        self.levels.iter().find(|l| l.ratio == ratio)
    }

    /// Label -> rounded price mapping in ratio order
    pub fn labelled(&self) -> Vec<(String, f64)> {
        self.levels.iter().map(|l| (l.label.clone(), l.rounded())).collect()
    }

    pub fn retracement_zone(&self) -> Vec<&FibLevel> {
        RETRACEMENT_RATIOS.iter().filter_map(|&r| self.level(r)).collect()
    }

    pub fn target_zone(&self) -> Vec<&FibLevel> {
        TARGET_RATIOS.iter().filter_map(|&r| self.level(r)).collect()
    }
}

fn ratio_label(ratio: f64) -> String {
    if ratio.fract() == 0.0 {
        format!("{ratio:.1}")
    } else {
        format!("{ratio}")
    }
}

/// Fibonacci projection engine
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProjectionEngine;

impl ProjectionEngine {
    /// Project from `range` against `manipulation`.
    ///
    /// `None` (no manipulation direction) is an expected outcome and yields
    /// `NotFound(NoDirection)`.
    pub fn project(
        &self,
        range: &Range,
        manipulation: Option<BreakoutDirection>,
    ) -> Detection<FibProjection> {
        let Some(manipulation) = manipulation else {
            return Detection::NotFound(NotFoundReason::NoDirection);
        };

        let (anchor0, anchor1) = match manipulation {
            BreakoutDirection::Up => (range.low, range.high),
            BreakoutDirection::Down => (range.high, range.low),
        };
        let direction = manipulation.opposite();
        let diff = anchor1 - anchor0;

        let levels: Vec<FibLevel> = FIB_RATIOS
            .iter()
            .map(|&ratio| FibLevel {
                ratio,
                label: ratio_label(ratio),
                price: anchor0 + diff * ratio,
            })
            .collect();

        let rounded = |ratios: &[f64]| -> String {
            ratios
                .iter()
                .filter_map(|&r| levels.iter().find(|l| l.ratio == r))
                .map(|l| format!("{:.2}", l.rounded()))
                .collect::<Vec<_>>()
                .join(" / ")
        };
        let message = format!(
            "IRZ levels (projected {}): retrace zone {} | targets {}",
            if direction == BreakoutDirection::Up { "upward" } else { "downward" },
            rounded(&RETRACEMENT_RATIOS),
            rounded(&TARGET_RATIOS[1..]),
        );

        tracing::debug!(anchor0, anchor1, ?direction, "fib projection");

        Detection::Found(FibProjection { anchor0, anchor1, direction, levels, message })
    }

    /// Project from a free-form direction label ("up" / "down"). Anything else
    /// yields `NotFound(InvalidDirection)` rather than an error.
    pub fn project_label(&self, range: &Range, label: &str) -> Detection<FibProjection> {
        match label.parse::<BreakoutDirection>() {
            Ok(direction) => self.project(range, Some(direction)),
            Err(_) => Detection::NotFound(NotFoundReason::InvalidDirection(label.to_string())),
        }
    }
}

// ============================================================
// TESTS
// ============================================================
