//! Stop-hunt (manipulation) detection
//!
//! Scans the trailing `lookback` bars in order against a detected [`Range`],
//! starting no earlier than the range's first bar:
//!
//! ```text
//! Clean --breach--> Breakout(dir) --close back inside--> Clean (run confirmed)
//!                   Breakout(dir) --new extreme--------> Breakout(dir)
//!                   Breakout(dir) --close beyond other edge--> Breakout(!dir)
//! ```
//!
//! Every confirmed run is kept; the canonical event is the run with the
//! largest deviation from its breached edge (earliest wins ties). A scan that
//! ends inside a breakout reports `AwaitingReturn` and no canonical event.

use super::range::Range;
use crate::{AnalysisError, BreakoutDirection, Period, Result, OHLCV};

/// Which price opens a breakout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BreakoutTrigger {
    /// High above / low below the box
    #[default]
    Wick,
    /// Close above / below the box
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ManipulationStatus {
    /// No breakout in the lookback
    Clean,
    /// Broke out and closed back inside
    Manipulated,
    /// The latest breakout has not returned yet
    AwaitingReturn,
}

/// A confirmed breakout-then-return run, reported at its most extreme bar
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ManipulationEvent {
    pub direction: BreakoutDirection,
    /// Extreme wick price of the run, strictly outside the box
    pub breakout_price: f64,
    pub return_confirmed: bool,
    /// Bar index of the extreme
    pub index: usize,
    pub timestamp: Option<i64>,
    /// Distance of `breakout_price` from the breached edge
    pub deviation: f64,
    pub return_index: usize,
    pub return_close: f64,
}

/// A breakout still outside the box when the scan ended
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PendingBreakout {
    pub direction: BreakoutDirection,
    pub extreme_price: f64,
    pub index: usize,
    pub timestamp: Option<i64>,
    pub deviation: f64,
    pub started_at: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ManipulationReport {
    pub status: ManipulationStatus,
    /// Canonical event; only set when `status` is `Manipulated`
    pub event: Option<ManipulationEvent>,
    pub pending: Option<PendingBreakout>,
    /// Every confirmed run in scan order
    pub confirmed: Vec<ManipulationEvent>,
    /// Bars examined
    pub scanned: usize,
    pub message: String,
}

impl ManipulationReport {
    /// Direction of the canonical event
    pub fn direction(&self) -> Option<BreakoutDirection> {
        self.event.map(|e| e.direction)
    }

    pub fn is_manipulated(&self) -> bool {
        self.status == ManipulationStatus::Manipulated
    }
}

/// Open breakout being tracked by the scan
#[derive(Debug, Clone, Copy)]
struct Run {
    direction: BreakoutDirection,
    started_at: usize,
    extreme_index: usize,
    extreme_price: f64,
    deviation: f64,
}

#[derive(Debug, Clone, Copy)]
enum ScanState {
    Clean,
    Breakout(Run),
}

/// Wick distance beyond the edge on the `direction` side (positive = outside)
#[inline]
fn wick_deviation<T: OHLCV>(direction: BreakoutDirection, bar: &T, range: &Range) -> f64 {
    match direction {
        BreakoutDirection::Up => bar.high() - range.high,
        BreakoutDirection::Down => range.low - bar.low(),
    }
}

#[inline]
fn wick_extreme<T: OHLCV>(direction: BreakoutDirection, bar: &T) -> f64 {
    match direction {
        BreakoutDirection::Up => bar.high(),
        BreakoutDirection::Down => bar.low(),
    }
}

impl Run {
    fn open<T: OHLCV>(direction: BreakoutDirection, index: usize, bar: &T, range: &Range) -> Self {
        Self {
            direction,
            started_at: index,
            extreme_index: index,
            extreme_price: wick_extreme(direction, bar),
            deviation: wick_deviation(direction, bar, range),
        }
    }

    fn extend<T: OHLCV>(&mut self, index: usize, bar: &T, range: &Range) {
        let deviation = wick_deviation(self.direction, bar, range);
        if deviation > self.deviation {
            self.deviation = deviation;
            self.extreme_index = index;
            self.extreme_price = wick_extreme(self.direction, bar);
        }
    }
}

/// Manipulation detector configuration
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ManipulationDetector {
    /// Trailing bars scanned
    pub lookback: Period,
    pub trigger: BreakoutTrigger,
}

impl Default for ManipulationDetector {
    fn default() -> Self {
        Self {
            lookback: Period::new_const(300),
            trigger: BreakoutTrigger::Wick,
        }
    }
}

impl ManipulationDetector {
    pub fn validate_config(&self) -> Result<()> {
        if self.lookback.get() < 2 {
            return Err(AnalysisError::InvalidConfig(
                "manipulation lookback must cover at least 2 bars".into(),
            ));
        }
        Ok(())
    }

    /// Scan `bars` against `range`. Pure: identical input, identical output.
    ///
    /// Bars before `range.start_index` predate the box and are skipped.
    pub fn detect<T: OHLCV>(&self, bars: &[T], range: &Range) -> ManipulationReport {
        let start = bars
            .len()
            .saturating_sub(self.lookback.get())
            .max(range.start_index)
            .min(bars.len());
        let mut confirmed = Vec::new();
        let mut state = ScanState::Clean;

        for (index, bar) in bars.iter().enumerate().skip(start) {
            state = match state {
                ScanState::Clean => match self.breach(bar, range) {
                    Some(direction) => {
                        let run = Run::open(direction, index, bar, range);
                        settle(run, index, bars, range, &mut confirmed)
                    },
                    None => ScanState::Clean,
                },
                ScanState::Breakout(mut run) => match crossed_through(run.direction, bar, range) {
                    Some(flipped) => {
                        tracing::debug!(
                            from = ?run.direction,
                            to = ?flipped,
                            index,
                            "breakout crossed through the opposite edge"
                        );
                        let run = Run::open(flipped, index, bar, range);
                        settle(run, index, bars, range, &mut confirmed)
                    },
                    None => {
                        run.extend(index, bar, range);
                        settle(run, index, bars, range, &mut confirmed)
                    },
                },
            };
        }

        let pending = match state {
            ScanState::Breakout(run) => Some(PendingBreakout {
                direction: run.direction,
                extreme_price: run.extreme_price,
                index: run.extreme_index,
                timestamp: bars[run.extreme_index].timestamp(),
                deviation: run.deviation,
                started_at: run.started_at,
            }),
            ScanState::Clean => None,
        };

        let canonical = confirmed.iter().copied().fold(None, |best: Option<ManipulationEvent>, e| {
            match best {
                Some(b) if e.deviation <= b.deviation => Some(b),
                _ => Some(e),
            }
        });

        let (status, event, message) = match (pending, canonical) {
            (Some(p), _) => (
                ManipulationStatus::AwaitingReturn,
                None,
                format!(
                    "Breakout detected {} but price has NOT returned into the range yet.",
                    p.direction
                ),
            ),
            (None, Some(e)) => (
                ManipulationStatus::Manipulated,
                Some(e),
                format!(
                    "Manipulation detected: price broke {} to {:.2} and returned into the range.",
                    e.direction, e.breakout_price
                ),
            ),
            (None, None) => {
                (ManipulationStatus::Clean, None, "No manipulation detected.".to_string())
            },
        };

        tracing::debug!(?status, runs = confirmed.len(), scanned = bars.len() - start, "manipulation scan");

        ManipulationReport {
            status,
            event,
            pending,
            confirmed,
            scanned: bars.len() - start,
            message,
        }
    }

    /// Breakout direction opened by `bar` from a clean state. A bar breaching
    /// both edges opens toward the larger deviation, up on a tie.
    fn breach<T: OHLCV>(&self, bar: &T, range: &Range) -> Option<BreakoutDirection> {
        match self.trigger {
            BreakoutTrigger::Wick => {
                let up = wick_deviation(BreakoutDirection::Up, bar, range);
                let down = wick_deviation(BreakoutDirection::Down, bar, range);
                match (up > 0.0, down > 0.0) {
                    (true, true) if down > up => Some(BreakoutDirection::Down),
                    (true, _) => Some(BreakoutDirection::Up),
                    (false, true) => Some(BreakoutDirection::Down),
                    (false, false) => None,
                }
            },
            BreakoutTrigger::Close => {
                let close = bar.close();
                if close > range.high {
                    Some(BreakoutDirection::Up)
                } else if close < range.low {
                    Some(BreakoutDirection::Down)
                } else {
                    None
                }
            },
        }
    }
}

/// Close beyond the edge opposite to the run: the run flips without a return.
#[inline]
fn crossed_through<T: OHLCV>(
    direction: BreakoutDirection,
    bar: &T,
    range: &Range,
) -> Option<BreakoutDirection> {
    let close = bar.close();
    match direction {
        BreakoutDirection::Up if close < range.low => Some(BreakoutDirection::Down),
        BreakoutDirection::Down if close > range.high => Some(BreakoutDirection::Up),
        _ => None,
    }
}

/// Confirm the run if `bars[index]` closed back inside, otherwise keep it open.
fn settle<T: OHLCV>(
    run: Run,
    index: usize,
    bars: &[T],
    range: &Range,
    confirmed: &mut Vec<ManipulationEvent>,
) -> ScanState {
    let close = bars[index].close();
    if !range.contains(close) {
        return ScanState::Breakout(run);
    }
    confirmed.push(ManipulationEvent {
        direction: run.direction,
        breakout_price: run.extreme_price,
        return_confirmed: true,
        index: run.extreme_index,
        timestamp: bars[run.extreme_index].timestamp(),
        deviation: run.deviation,
        return_index: index,
        return_close: close,
    });
    ScanState::Clean
}

// ============================================================
// TESTS
// ============================================================
