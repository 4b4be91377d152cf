//! Common numeric helpers shared across the detector modules
//!
//! True range / ATR, swing pivots, least-squares and consensus line fits.

use crate::{CancelToken, OHLCVExt, OHLCV, Result};

// ============================================================
// VOLATILITY
// ============================================================

/// True range of `bars[at]`, using the previous bar's close when one exists.
#[inline]
pub fn true_range_at<T: OHLCV>(bars: &[T], at: usize) -> f64 {
    let prev_close = at.checked_sub(1).map(|p| bars[p].close());
    bars[at].true_range(prev_close)
}

/// Average true range over `bars[start..end]`.
///
/// The first bar of the slice still sees the close before `start`, so a
/// window cut out of a longer series does not lose its opening gap.
pub fn average_true_range<T: OHLCV>(bars: &[T], start: usize, end: usize) -> f64 {
    if end <= start {
        return 0.0;
    }
    let sum: f64 = (start..end).map(|i| true_range_at(bars, i)).sum();
    sum / (end - start) as f64
}

/// Round to 2 decimal places (price display precision).
#[inline]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================
// PIVOTS
// ============================================================

/// Which price of a bar is used for pivot detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PivotSource {
    /// Body extremes: max/min of open and close
    #[default]
    Body,
    /// Wick extremes: high and low
    Wick,
}

impl PivotSource {
    #[inline]
    pub fn upper<T: OHLCV>(self, bar: &T) -> f64 {
        match self {
            PivotSource::Body => bar.body_high(),
            PivotSource::Wick => bar.high(),
        }
    }

    #[inline]
    pub fn lower<T: OHLCV>(self, bar: &T) -> f64 {
        match self {
            PivotSource::Body => bar.body_low(),
            PivotSource::Wick => bar.low(),
        }
    }
}

/// A swing point used as a trendline anchor
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PivotPoint {
    pub index: usize,
    pub price: f64,
}

/// Indices `i` in `w..len-w` where `value(i)` beats every other value in
/// `[i-w, i+w]` according to `beats`. Strict: a tie with any neighbour is not
/// a pivot.
fn strict_extrema(values: &[f64], w: usize, beats: impl Fn(f64, f64) -> bool) -> Vec<usize> {
    let len = values.len();
    if w == 0 || len < 2 * w + 1 {
        return Vec::new();
    }
    (w..len - w)
        .filter(|&i| {
            let v = values[i];
            (i - w..=i + w).all(|j| j == i || beats(v, values[j]))
        })
        .collect()
}

/// Pivot highs and lows over every window size, deduplicated by index and
/// returned in index order.
pub fn find_pivots<T: OHLCV>(
    bars: &[T],
    windows: &[usize],
    source: PivotSource,
) -> (Vec<PivotPoint>, Vec<PivotPoint>) {
    let uppers: Vec<f64> = bars.iter().map(|b| source.upper(b)).collect();
    let lowers: Vec<f64> = bars.iter().map(|b| source.lower(b)).collect();

    let mut high_idx: Vec<usize> = Vec::new();
    let mut low_idx: Vec<usize> = Vec::new();
    for &w in windows {
        high_idx.extend(strict_extrema(&uppers, w, |a, b| a > b));
        low_idx.extend(strict_extrema(&lowers, w, |a, b| a < b));
    }
    high_idx.sort_unstable();
    high_idx.dedup();
    low_idx.sort_unstable();
    low_idx.dedup();

    let highs = high_idx
        .into_iter()
        .map(|index| PivotPoint { index, price: uppers[index] })
        .collect();
    let lows = low_idx
        .into_iter()
        .map(|index| PivotPoint { index, price: lowers[index] })
        .collect();
    (highs, lows)
}

// ============================================================
// LINE FITTING
// ============================================================

/// `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LineFit {
    #[inline]
    pub fn value_at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    fn through(a: &PivotPoint, b: &PivotPoint) -> Option<Self> {
        let dx = b.index as f64 - a.index as f64;
        if dx.abs() <= f64::EPSILON {
            return None;
        }
        let slope = (b.price - a.price) / dx;
        Some(Self { slope, intercept: a.price - slope * a.index as f64 })
    }
}

/// Ordinary least squares over (index, price). `None` for fewer than two
/// points or when every x is identical.
pub fn least_squares(points: &[PivotPoint]) -> Option<LineFit> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.index as f64).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.price).sum::<f64>() / n;

    let (sxx, sxy) = points.iter().fold((0.0, 0.0), |(sxx, sxy), p| {
        let dx = p.index as f64 - mean_x;
        (sxx + dx * dx, sxy + dx * (p.price - mean_y))
    });
    if sxx <= f64::EPSILON {
        return None;
    }
    let slope = sxy / sxx;
    Some(LineFit { slope, intercept: mean_y - slope * mean_x })
}

/// Pearson correlation of (index, price).
///
/// A set with no price variance lies exactly on a horizontal line and is
/// reported as a perfect fit (1.0). `None` when x has no variance.
pub fn correlation(points: &[PivotPoint]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.index as f64).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.price).sum::<f64>() / n;

    let (sxx, syy, sxy) = points.iter().fold((0.0, 0.0, 0.0), |(sxx, syy, sxy), p| {
        let dx = p.index as f64 - mean_x;
        let dy = p.price - mean_y;
        (sxx + dx * dx, syy + dy * dy, sxy + dx * dy)
    });
    if sxx <= f64::EPSILON {
        return None;
    }
    let scale = mean_y.abs().max(1.0);
    if syy.sqrt() <= f64::EPSILON * scale * n {
        return Some(1.0);
    }
    Some(sxy / (sxx.sqrt() * syy.sqrt()))
}

/// Median of a non-empty slice (sorted copy, mean of the two middles).
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Median absolute deviation around the median.
pub fn median_abs_deviation(values: &[f64]) -> Option<f64> {
    let m = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - m).abs()).collect();
    median(&deviations)
}

/// Outcome of a consensus fit: the refitted line and the inliers it used.
#[derive(Debug, Clone)]
pub struct ConsensusFit {
    pub line: LineFit,
    pub inliers: Vec<PivotPoint>,
}

/// Candidate pairs scored between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 64;

/// Pair `(a, b)`, `a < b`, at position `t` of the row-major pair order,
/// resuming the walk from `(row, row_start)`. Positions must not decrease
/// between calls.
#[inline]
fn pair_at(n: usize, t: usize, row: &mut usize, row_start: &mut usize) -> (usize, usize) {
    while t >= *row_start + (n - 1 - *row) {
        *row_start += n - 1 - *row;
        *row += 1;
    }
    (*row, *row + 1 + (t - *row_start))
}

/// Outlier-robust line fit.
///
/// Pairs of points propose candidate lines; points whose residual is within
/// the median absolute deviation of the prices count as a candidate's
/// inliers. The candidate with the most inliers wins (ties: smaller inlier
/// squared error, then the earlier pair), and the final line is a
/// least-squares refit over its inliers.
///
/// At most `max_samples` pairs are scored, spread evenly over the row-major
/// pair order, so the cost is O(max_samples * P) and identical input always
/// yields identical output. Small pivot sets are searched exhaustively.
/// `cancel` is polled while sampling.
pub fn consensus_fit(
    points: &[PivotPoint],
    max_samples: usize,
    cancel: &CancelToken,
) -> Result<Option<ConsensusFit>> {
    let n = points.len();
    if n < 2 {
        return Ok(None);
    }
    let prices: Vec<f64> = points.iter().map(|p| p.price).collect();
    let Some(mad) = median_abs_deviation(&prices) else {
        return Ok(None);
    };
    let scale = prices.iter().fold(1.0_f64, |acc, p| acc.max(p.abs()));
    let threshold = mad + 1e-9 * scale;

    let total = n * (n - 1) / 2;
    let samples = total.min(max_samples.max(1));
    let (mut row, mut row_start) = (0usize, 0usize);

    let mut best: Option<(usize, f64, LineFit)> = None;
    for k in 0..samples {
        if k % CANCEL_CHECK_INTERVAL == 0 {
            cancel.check()?;
        }
        let t = (k as u128 * total as u128 / samples as u128) as usize;
        let (a, b) = pair_at(n, t, &mut row, &mut row_start);
        let Some(candidate) = LineFit::through(&points[a], &points[b]) else {
            continue;
        };
        let (count, sse) = points.iter().fold((0usize, 0.0), |(count, sse), p| {
            let residual = (p.price - candidate.value_at(p.index as f64)).abs();
            if residual <= threshold {
                (count + 1, sse + residual * residual)
            } else {
                (count, sse)
            }
        });
        let better = match best {
            None => true,
            Some((best_count, best_sse, _)) => {
                count > best_count || (count == best_count && sse < best_sse)
            },
        };
        if better {
            best = Some((count, sse, candidate));
        }
    }

    let Some((_, _, candidate)) = best else {
        return Ok(None);
    };
    let inliers: Vec<PivotPoint> = points
        .iter()
        .copied()
        .filter(|p| (p.price - candidate.value_at(p.index as f64)).abs() <= threshold)
        .collect();
    let line = least_squares(&inliers).unwrap_or(candidate);
    Ok(Some(ConsensusFit { line, inliers }))
}

// ============================================================
// TESTS
// ============================================================
