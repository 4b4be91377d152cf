//! Consolidation range detection
//!
//! The candidate box is the body extremes (max/min of open and close) of the
//! trailing `window` bars. It counts as a range when it is tight relative to
//! the average true range, or when both edges have been touched by wicks at
//! least `min_bounces` times.

use super::helpers::{self, average_true_range};
use crate::{AnalysisError, OHLCVExt, Period, Ratio, Result, OHLCV};

/// Wick touches counted against each edge of the box
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TouchCounts {
    pub low: usize,
    pub high: usize,
}

/// A detected consolidation box
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Range {
    pub low: f64,
    pub high: f64,
    /// Number of trailing bars the box was built from
    pub window: usize,
    /// Index of the first bar of the window
    pub start_index: usize,
    pub touches: TouchCounts,
    /// Average true range over the window
    pub atr: f64,
    pub is_tight: bool,
    pub is_range: bool,
}

impl Range {
    #[inline]
    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    /// Closed-interval containment: both edges are inside.
    #[inline]
    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }

    /// Position of `price` relative to the box: 0.0 at `low`, 1.0 at `high`.
    /// `None` for a zero-width box.
    pub fn relative_position(&self, price: f64) -> Option<f64> {
        let width = self.width();
        (width > f64::EPSILON).then(|| (price - self.low) / width)
    }

    /// Edges rounded for display; detection keeps full precision.
    pub fn rounded(&self) -> (f64, f64) {
        (helpers::round2(self.low), helpers::round2(self.high))
    }

    pub fn message(&self) -> String {
        let verdict = if self.is_range {
            "range"
        } else {
            "no range"
        };
        format!(
            "Range (body-only) over last {} bars: {:.2} - {:.2} ({}, touches low {} / high {})",
            self.window, self.low, self.high, verdict, self.touches.low, self.touches.high
        )
    }
}

/// Range detector configuration
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RangeDetector {
    /// Trailing bars that form the box
    pub window: Period,
    /// Box is tight when `width < atr * atr_multiplier`
    pub atr_multiplier: f64,
    /// Touch tolerance as a fraction of the box width
    pub tolerance_pct: Ratio,
    /// Touches required on each edge
    pub min_bounces: usize,
}

impl Default for RangeDetector {
    fn default() -> Self {
        Self {
            window: Period::new_const(50),
            atr_multiplier: 3.0,
            tolerance_pct: Ratio::new_const(0.02),
            min_bounces: 3,
        }
    }
}

impl RangeDetector {
    pub fn with_window(mut self, window: Period) -> Self {
        self.window = window;
        self
    }

    pub fn validate_config(&self) -> Result<()> {
        if !self.atr_multiplier.is_finite() || self.atr_multiplier <= 0.0 {
            return Err(AnalysisError::OutOfRange {
                field: "atr_multiplier",
                value: self.atr_multiplier,
                min: f64::MIN_POSITIVE,
                max: f64::MAX,
            });
        }
        if self.min_bounces == 0 {
            return Err(AnalysisError::InvalidValue("min_bounces must be > 0"));
        }
        Ok(())
    }

    /// Detect the range over the trailing window.
    ///
    /// Fails with [`AnalysisError::InsufficientData`] when there are fewer
    /// bars than the window; callers treat that as "no range".
    pub fn detect<T: OHLCV>(&self, bars: &[T]) -> Result<Range> {
        let window = self.window.get();
        if bars.len() < window {
            return Err(AnalysisError::InsufficientData { need: window, got: bars.len() });
        }

        let start = bars.len() - window;
        let recent = &bars[start..];

        let (low, high) = recent
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), bar| {
                (lo.min(bar.body_low()), hi.max(bar.body_high()))
            });

        let atr = average_true_range(bars, start, bars.len());
        let width = high - low;
        let tolerance = width * self.tolerance_pct.get();

        let touches = TouchCounts {
            low: recent
                .iter()
                .filter(|b| (b.low() - low).abs() <= tolerance)
                .count(),
            high: recent
                .iter()
                .filter(|b| (b.high() - high).abs() <= tolerance)
                .count(),
        };

        let is_tight = width < atr * self.atr_multiplier;
        let is_range = is_tight
            || (touches.low >= self.min_bounces && touches.high >= self.min_bounces);

        tracing::debug!(
            low,
            high,
            window,
            atr,
            touches_low = touches.low,
            touches_high = touches.high,
            is_range,
            "range detection"
        );

        Ok(Range {
            low,
            high,
            window,
            start_index: start,
            touches,
            atr,
            is_tight,
            is_range,
        })
    }
}

// ============================================================
// TESTS
// ============================================================
