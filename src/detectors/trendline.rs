//! Trendline fitting and classification
//!
//! Pivot lows feed the support candidate and pivot highs the resistance
//! candidate. Each is fitted independently with [`consensus_fit`], rejected
//! below `min_points` inliers or `min_correlation`, then classified by where
//! recent closes sit relative to the projected line.
//!
//! The consensus search scores at most `max_samples` pivot pairs, so a fit
//! costs O(max_samples * pivots). [`TrendlineFitter::fit_with`] polls a
//! [`CancelToken`] while it searches.

use super::helpers::{consensus_fit, correlation, find_pivots, LineFit, PivotPoint, PivotSource};
use crate::{
    AnalysisError, CancelToken, Detection, NotFoundReason, Ratio, Result, Timeframe, OHLCV,
};

/// Which pivots a line was fitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TrendSource {
    /// Fitted to pivot lows
    Support,
    /// Fitted to pivot highs
    Resistance,
}

/// Current role of a fitted line
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TrendRole {
    Support,
    Resistance,
    Ambiguous,
    /// Resistance line now holding price from below
    FlippedSupport,
    /// Support line now capping price from above
    FlippedResistance,
}

impl TrendRole {
    /// Roles worth reporting
    #[inline]
    pub fn is_active(self) -> bool {
        !matches!(self, TrendRole::Ambiguous)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Trendline {
    pub source: TrendSource,
    pub role: TrendRole,
    pub slope: f64,
    /// Price at bar index 0
    pub intercept: f64,
    /// First supporting pivot
    pub anchor_index: usize,
    /// Pivots the final fit used, in index order (at least 3)
    pub points: Vec<PivotPoint>,
    pub correlation: f64,
    /// Fraction of lookback closes strictly above the line
    pub above: f64,
    /// Fraction of lookback closes strictly below the line
    pub below: f64,
}

impl Trendline {
    #[inline]
    pub fn value_at(&self, index: usize) -> f64 {
        self.slope * index as f64 + self.intercept
    }
}

/// Support and resistance candidates of one fit
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrendlineSet {
    pub support: Detection<Trendline>,
    pub resistance: Detection<Trendline>,
}

impl TrendlineSet {
    pub fn not_found(reason: NotFoundReason) -> Self {
        Self {
            support: Detection::NotFound(reason.clone()),
            resistance: Detection::NotFound(reason),
        }
    }

    /// Reported lines: zero, one or two.
    pub fn lines(&self) -> impl Iterator<Item = &Trendline> {
        self.support.found().into_iter().chain(self.resistance.found())
    }

    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .lines()
            .map(|l| format!("{:?} trendline (slope {:.4}, {} points)", l.role, l.slope, l.points.len()))
            .collect();
        if parts.is_empty() {
            "No active trendline near current price".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Trendline fitter configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrendlineFitter {
    /// Half-widths of the pivot windows; pivots from every size are pooled
    pub pivot_windows: Vec<usize>,
    pub pivot_source: PivotSource,
    /// Minimum inliers behind a line
    pub min_points: usize,
    /// Minimum |r| of the inliers
    pub min_correlation: Ratio,
    /// Share of closes on one side that settles the role
    pub dominance: Ratio,
    /// Share of closes needed on the new side for a role flip
    pub flip_threshold: Ratio,
    /// Pivot pairs scored per candidate; below this the search is exhaustive
    pub max_samples: usize,
}

impl Default for TrendlineFitter {
    fn default() -> Self {
        Self {
            pivot_windows: vec![3, 5, 7],
            pivot_source: PivotSource::Body,
            min_points: 3,
            min_correlation: Ratio::new_const(0.85),
            dominance: Ratio::new_const(0.70),
            flip_threshold: Ratio::new_const(0.40),
            max_samples: 1024,
        }
    }
}

impl TrendlineFitter {
    pub fn validate_config(&self) -> Result<()> {
        if self.pivot_windows.is_empty() || self.pivot_windows.contains(&0) {
            return Err(AnalysisError::InvalidConfig(
                "pivot_windows must be non-empty and positive".into(),
            ));
        }
        if self.min_points < 3 {
            return Err(AnalysisError::OutOfRange {
                field: "min_points",
                value: self.min_points as f64,
                min: 3.0,
                max: f64::MAX,
            });
        }
        if self.max_samples == 0 {
            return Err(AnalysisError::OutOfRange {
                field: "max_samples",
                value: 0.0,
                min: 1.0,
                max: f64::MAX,
            });
        }
        Ok(())
    }

    /// Bars needed for the smallest pivot window to see a single pivot
    pub fn min_bars(&self) -> usize {
        self.pivot_windows.iter().copied().min().unwrap_or(1) * 2 + 1
    }

    /// Fit with the classification lookback chosen for `timeframe`.
    pub fn fit_for<T: OHLCV>(&self, bars: &[T], timeframe: Timeframe) -> TrendlineSet {
        self.fit(bars, timeframe.classification_bars())
    }

    /// [`fit_for`](Self::fit_for) that stops with [`AnalysisError::Cancelled`]
    /// once `cancel` fires.
    pub fn fit_for_with<T: OHLCV>(
        &self,
        bars: &[T],
        timeframe: Timeframe,
        cancel: &CancelToken,
    ) -> Result<TrendlineSet> {
        self.fit_with(bars, timeframe.classification_bars(), cancel)
    }

    /// Fit both candidates, classifying over the last `lookback` closes.
    pub fn fit<T: OHLCV>(&self, bars: &[T], lookback: usize) -> TrendlineSet {
        self.fit_with(bars, lookback, &CancelToken::new()).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "trendline fit failed");
            TrendlineSet::not_found(NotFoundReason::AnalysisFailed)
        })
    }

    /// [`fit`](Self::fit) that polls `cancel` between candidates and inside
    /// the consensus search.
    pub fn fit_with<T: OHLCV>(
        &self,
        bars: &[T],
        lookback: usize,
        cancel: &CancelToken,
    ) -> Result<TrendlineSet> {
        let need = self.min_bars();
        if bars.len() < need {
            return Ok(TrendlineSet::not_found(NotFoundReason::InsufficientData {
                need,
                got: bars.len(),
            }));
        }

        let (highs, lows) = find_pivots(bars, &self.pivot_windows, self.pivot_source);
        tracing::debug!(highs = highs.len(), lows = lows.len(), "pivots found");

        Ok(TrendlineSet {
            support: self.fit_source(TrendSource::Support, &lows, bars, lookback, cancel)?,
            resistance: self.fit_source(TrendSource::Resistance, &highs, bars, lookback, cancel)?,
        })
    }

    fn fit_source<T: OHLCV>(
        &self,
        source: TrendSource,
        pivots: &[PivotPoint],
        bars: &[T],
        lookback: usize,
        cancel: &CancelToken,
    ) -> Result<Detection<Trendline>> {
        cancel.check()?;
        if pivots.len() < self.min_points {
            return Ok(Detection::NotFound(NotFoundReason::TooFewPivots { found: pivots.len() }));
        }
        let Some(fit) = consensus_fit(pivots, self.max_samples, cancel)? else {
            return Ok(Detection::NotFound(NotFoundReason::TooFewPivots { found: pivots.len() }));
        };
        if fit.inliers.len() < self.min_points {
            tracing::debug!(?source, inliers = fit.inliers.len(), "too few inliers");
            return Ok(Detection::NotFound(NotFoundReason::TooFewPivots {
                found: fit.inliers.len(),
            }));
        }

        let r = correlation(&fit.inliers).unwrap_or(0.0);
        if r.abs() < self.min_correlation.get() {
            tracing::debug!(?source, correlation = r, "weak trendline fit rejected");
            return Ok(Detection::NotFound(NotFoundReason::WeakCorrelation { correlation: r }));
        }

        let (role, above, below) = self.classify(source, fit.line, bars, lookback);
        if !role.is_active() {
            return Ok(Detection::NotFound(NotFoundReason::AmbiguousRole { above, below }));
        }

        Ok(Detection::Found(Trendline {
            source,
            role,
            slope: fit.line.slope,
            intercept: fit.line.intercept,
            anchor_index: fit.inliers[0].index,
            points: fit.inliers,
            correlation: r,
            above,
            below,
        }))
    }

    /// Role of `line` over the last `lookback` closes, with the fractions of
    /// closes strictly above and below it.
    pub fn classify<T: OHLCV>(
        &self,
        source: TrendSource,
        line: LineFit,
        bars: &[T],
        lookback: usize,
    ) -> (TrendRole, f64, f64) {
        if bars.is_empty() {
            return (TrendRole::Ambiguous, 0.0, 0.0);
        }
        let n = lookback.clamp(1, bars.len());
        let start = bars.len() - n;

        let (above, below) = bars[start..].iter().enumerate().fold((0usize, 0usize), |(a, b), (k, bar)| {
            let level = line.value_at((start + k) as f64);
            let close = bar.close();
            (a + (close > level) as usize, b + (close < level) as usize)
        });
        let above = above as f64 / n as f64;
        let below = below as f64 / n as f64;

        let last = bars.len() - 1;
        let last_close = bars[last].close();
        let last_level = line.value_at(last as f64);
        let dominance = self.dominance.get();
        let flip = self.flip_threshold.get();

        let role = if above > dominance {
            TrendRole::Support
        } else if below > dominance {
            TrendRole::Resistance
        } else {
            match source {
                TrendSource::Resistance
                    if line.slope > 0.0 && last_level < last_close && above >= flip =>
                {
                    TrendRole::FlippedSupport
                },
                TrendSource::Support
                    if line.slope < 0.0 && last_level > last_close && below >= flip =>
                {
                    TrendRole::FlippedResistance
                },
                _ => TrendRole::Ambiguous,
            }
        };

        (role, above, below)
    }
}

// ============================================================
// TESTS
// ============================================================
