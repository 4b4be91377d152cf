//! # rangehunter - market-structure analysis for candle series
//!
//! Detects consolidation ranges, stop-hunt breakouts that return into the
//! range, robust trendlines through swing pivots, and fibonacci projections
//! anchored to the range.
//!
//! ## Quick Start
//!
//! ```rust
//! use rangehunter::prelude::*;
//!
//! // Alternating bars pinned between 99 and 101
//! let bars: Vec<Candle> = (0..60)
//!     .map(|i| {
//!         let (o, c) = if i % 2 == 0 { (99.0, 101.0) } else { (101.0, 99.0) };
//!         Candle::new(i, o, 101.0, 99.0, c, 1_000.0)
//!     })
//!     .collect();
//!
//! let engine = EngineBuilder::new().build().unwrap();
//! let report = engine.analyze("ES", Timeframe::H1, &bars);
//!
//! assert!(report.error.is_none());
//! assert!(report.range.found().map_or(false, |r| r.is_range));
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod detectors;
pub mod params;

pub mod prelude {
    pub use crate::{
        // Detectors
        detectors::*,
        // Parameters
        params::{ParamMeta, ParamType, ParameterizedDetector},
        // Parallel
        analyze_parallel,
        AnalysisFailure,
        AnalysisJob,
        // Engine
        AnalysisConfig,
        AnalysisEngine,
        EngineBuilder,
        // Types
        BreakoutDirection,
        CancelToken,
        Candle,
        CandleSeries,
        Detection,
        Direction,
        NotFoundReason,
        Period,
        Ratio,
        Report,
        Timeframe,
        WindowPolicy,
        // Core traits
        OHLCVExt,
        OHLCV,
        // Errors
        AnalysisError,
        Result,
    };
}

use detectors::{
    FibProjection, KeyLevels, LevelDetector, ManipulationDetector, ManipulationEvent,
    ManipulationReport, ProjectionEngine, Range, RangeDetector, TrendlineFitter, TrendlineSet,
};

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors raised by analysis. Expected "nothing found" outcomes are not
/// errors; see [`Detection`].
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize)]
pub enum AnalysisError {
    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Insufficient data: need {need} bars, got {got}")]
    InsufficientData { need: usize, got: usize },

    #[error("Invalid candle at index {index}: {reason}")]
    InvalidCandle { index: usize, reason: &'static str },

    #[error("Timestamp at index {index} does not increase")]
    NonMonotonicTimestamp { index: usize },

    #[error("Unknown timeframe: {0}")]
    UnknownTimeframe(String),

    #[error("Invalid direction: {0} (expected up or down)")]
    InvalidDirection(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

impl AnalysisError {
    /// Malformed input, as opposed to configuration or control flow
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            AnalysisError::InvalidCandle { .. } | AnalysisError::NonMonotonicTimestamp { .. }
        )
    }
}

// ============================================================
// VALIDATED TYPES
// ============================================================

/// Fraction in 0.0..=1.0 (tolerances, correlation and dominance thresholds)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Ratio(f64);

impl Ratio {
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(AnalysisError::InvalidValue("Ratio cannot be NaN or infinite"));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(AnalysisError::OutOfRange {
                field: "Ratio",
                value,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(Self(value))
    }

    /// Unchecked constructor for library defaults
    #[doc(hidden)]
    pub const fn new_const(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl serde::Serialize for Ratio {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for Ratio {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(d)?;
        Ratio::new(value).map_err(serde::de::Error::custom)
    }
}

/// Bar count (must be > 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Period(usize);

impl Period {
    pub fn new(value: usize) -> Result<Self> {
        if value == 0 {
            return Err(AnalysisError::InvalidValue("Period must be > 0"));
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl serde::Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = usize::deserialize(d)?;
        Period::new(value).map_err(serde::de::Error::custom)
    }
}

// ============================================================
// OHLCV TRAITS
// ============================================================

/// Core OHLCV data trait
pub trait OHLCV {
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
    fn volume(&self) -> f64;

    fn timestamp(&self) -> Option<i64> {
        None
    }
}

/// Computed properties shared by every detector
pub trait OHLCVExt: OHLCV {
    #[inline]
    fn body(&self) -> f64 {
        (self.close() - self.open()).abs()
    }

    #[inline]
    fn body_high(&self) -> f64 {
        self.open().max(self.close())
    }

    #[inline]
    fn body_low(&self) -> f64 {
        self.open().min(self.close())
    }

    #[inline]
    fn range(&self) -> f64 {
        self.high() - self.low()
    }

    #[inline]
    fn upper_shadow(&self) -> f64 {
        self.high() - self.body_high()
    }

    #[inline]
    fn lower_shadow(&self) -> f64 {
        self.body_low() - self.low()
    }

    #[inline]
    fn is_bullish(&self) -> bool {
        self.close() > self.open()
    }

    /// Wilder true range; `prev_close` is `None` for the first bar.
    #[inline]
    fn true_range(&self, prev_close: Option<f64>) -> f64 {
        let hl = self.high() - self.low();
        match prev_close {
            Some(pc) => hl.max((self.high() - pc).abs()).max((self.low() - pc).abs()),
            None => hl,
        }
    }

    /// Check `low <= min(open, close) <= max(open, close) <= high`, finite
    /// prices and non-negative volume. Index is filled in by the caller.
    fn validate(&self) -> Result<()> {
        let prices = [self.open(), self.high(), self.low(), self.close()];
        if prices.iter().any(|p| p.is_nan()) {
            return Err(AnalysisError::InvalidCandle { index: 0, reason: "NaN in OHLC" });
        }
        if prices.iter().any(|p| p.is_infinite()) {
            return Err(AnalysisError::InvalidCandle {
                index: 0,
                reason: "Infinite value in OHLC",
            });
        }
        if self.high() < self.low() {
            return Err(AnalysisError::InvalidCandle { index: 0, reason: "high < low" });
        }
        if self.body_low() < self.low() || self.body_high() > self.high() {
            return Err(AnalysisError::InvalidCandle {
                index: 0,
                reason: "body outside high/low",
            });
        }
        let volume = self.volume();
        if volume.is_nan() || volume < 0.0 {
            return Err(AnalysisError::InvalidCandle { index: 0, reason: "negative volume" });
        }
        Ok(())
    }
}

impl<T: OHLCV> OHLCVExt for T {}

/// Validate every bar and require strictly increasing timestamps where the
/// bars carry them.
pub fn validate_bars<T: OHLCV>(bars: &[T]) -> Result<()> {
    let mut prev: Option<i64> = None;
    for (i, bar) in bars.iter().enumerate() {
        bar.validate().map_err(|e| match e {
            AnalysisError::InvalidCandle { reason, .. } => {
                AnalysisError::InvalidCandle { index: i, reason }
            },
            other => other,
        })?;
        if let Some(ts) = bar.timestamp() {
            if prev.is_some_and(|p| ts <= p) {
                return Err(AnalysisError::NonMonotonicTimestamp { index: i });
            }
            prev = Some(ts);
        }
    }
    Ok(())
}

// ============================================================
// CANDLES
// ============================================================

/// One OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Candle {
    /// Bucket start (epoch seconds, or any strictly increasing key)
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { timestamp, open, high, low, close, volume }
    }
}

impl OHLCV for Candle {
    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn timestamp(&self) -> Option<i64> {
        Some(self.timestamp)
    }
}

/// Owned candle series, validated once on construction
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "Vec<Candle>", into = "Vec<Candle>")]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(candles: Vec<Candle>) -> Result<Self> {
        validate_bars(&candles)?;
        Ok(Self { candles })
    }

    /// Copy foreign bars into the fixed schema. Bars without a timestamp are
    /// keyed by their position.
    pub fn from_ohlcv<T: OHLCV>(bars: &[T]) -> Result<Self> {
        let candles = bars
            .iter()
            .enumerate()
            .map(|(i, b)| Candle {
                timestamp: b.timestamp().unwrap_or(i as i64),
                open: b.open(),
                high: b.high(),
                low: b.low(),
                close: b.close(),
                volume: b.volume(),
            })
            .collect();
        Self::new(candles)
    }

    #[inline]
    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    pub fn into_inner(self) -> Vec<Candle> {
        self.candles
    }
}

impl std::ops::Deref for CandleSeries {
    type Target = [Candle];

    fn deref(&self) -> &[Candle] {
        &self.candles
    }
}

impl AsRef<[Candle]> for CandleSeries {
    fn as_ref(&self) -> &[Candle] {
        &self.candles
    }
}

impl TryFrom<Vec<Candle>> for CandleSeries {
    type Error = AnalysisError;

    fn try_from(candles: Vec<Candle>) -> Result<Self> {
        Self::new(candles)
    }
}

impl From<CandleSeries> for Vec<Candle> {
    fn from(series: CandleSeries) -> Self {
        series.candles
    }
}

// ============================================================
// TIMEFRAME
// ============================================================

/// Bar duration. Only selects window and lookback sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1min")]
    M1,
    #[serde(rename = "5min")]
    M5,
    #[serde(rename = "15min")]
    M15,
    #[serde(rename = "30min")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1month")]
    Month1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 9] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
        Timeframe::Month1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1min",
            Timeframe::M5 => "5min",
            Timeframe::M15 => "15min",
            Timeframe::M30 => "30min",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::Month1 => "1month",
        }
    }

    pub fn seconds(self) -> u64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
            Timeframe::Month1 => 2_592_000,
        }
    }

    /// Trailing bars forming the consolidation box
    pub fn range_window(self) -> usize {
        match self {
            Timeframe::M15 => 96,
            Timeframe::M30 => 48,
            Timeframe::H1 => 50,
            Timeframe::H4 => 30,
            Timeframe::D1 => 15,
            _ => 50,
        }
    }

    /// Days of history used to classify trendlines
    pub fn classification_days(self) -> u64 {
        match self {
            Timeframe::M1 | Timeframe::M5 | Timeframe::M15 | Timeframe::M30 => 2,
            Timeframe::H1 | Timeframe::H4 => 15,
            Timeframe::D1 | Timeframe::W1 => 100,
            Timeframe::Month1 => 360,
        }
    }

    /// [`classification_days`](Self::classification_days) expressed in bars
    pub fn classification_bars(self) -> usize {
        let seconds = self.classification_days() * 86_400;
        seconds.div_ceil(self.seconds()) as usize
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1min" | "1m" => Ok(Timeframe::M1),
            "5min" | "5m" => Ok(Timeframe::M5),
            "15min" | "15m" => Ok(Timeframe::M15),
            "30min" | "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            "1w" => Ok(Timeframe::W1),
            "1month" => Ok(Timeframe::Month1),
            _ => Err(AnalysisError::UnknownTimeframe(s.to_string())),
        }
    }
}

// ============================================================
// DIRECTIONS
// ============================================================

/// Side of a range breakout, also the heading of a projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakoutDirection {
    Up,
    Down,
}

impl BreakoutDirection {
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            BreakoutDirection::Up => BreakoutDirection::Down,
            BreakoutDirection::Down => BreakoutDirection::Up,
        }
    }
}

impl fmt::Display for BreakoutDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakoutDirection::Up => "up",
            BreakoutDirection::Down => "down",
        })
    }
}

impl FromStr for BreakoutDirection {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(BreakoutDirection::Up),
            "down" => Ok(BreakoutDirection::Down),
            _ => Err(AnalysisError::InvalidDirection(s.to_string())),
        }
    }
}

/// Directional bias of a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Bullish,
    #[default]
    Neutral,
    Bearish,
}

impl Direction {
    #[inline]
    pub fn is_bullish(self) -> bool {
        matches!(self, Direction::Bullish)
    }

    #[inline]
    pub fn is_bearish(self) -> bool {
        matches!(self, Direction::Bearish)
    }
}

/// Bias follows where a projection heads
impl From<BreakoutDirection> for Direction {
    fn from(heading: BreakoutDirection) -> Self {
        match heading {
            BreakoutDirection::Up => Direction::Bullish,
            BreakoutDirection::Down => Direction::Bearish,
        }
    }
}

// ============================================================
// DETECTION OUTCOMES
// ============================================================

/// Why a detector produced nothing
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum NotFoundReason {
    InsufficientData { need: usize, got: usize },
    /// The analysis itself failed; see [`Report::error`]
    AnalysisFailed,
    TooFewPivots { found: usize },
    WeakCorrelation { correlation: f64 },
    AmbiguousRole { above: f64, below: f64 },
    /// No manipulation direction to project against
    NoDirection,
    InvalidDirection(String),
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundReason::InsufficientData { need, got } => {
                write!(f, "insufficient data: need {need} bars, got {got}")
            },
            NotFoundReason::AnalysisFailed => f.write_str("analysis failed"),
            NotFoundReason::TooFewPivots { found } => write!(f, "too few pivots ({found})"),
            NotFoundReason::WeakCorrelation { correlation } => {
                write!(f, "weak fit (r = {correlation:.3})")
            },
            NotFoundReason::AmbiguousRole { above, below } => write!(
                f,
                "ambiguous role ({:.0}% above / {:.0}% below)",
                above * 100.0,
                below * 100.0
            ),
            NotFoundReason::NoDirection => f.write_str("no manipulation direction"),
            NotFoundReason::InvalidDirection(d) => write!(f, "invalid direction {d:?}"),
        }
    }
}

/// Tagged result of a detector
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Detection<T> {
    Found(T),
    NotFound(NotFoundReason),
}

impl<T> Detection<T> {
    #[inline]
    pub fn found(&self) -> Option<&T> {
        match self {
            Detection::Found(v) => Some(v),
            Detection::NotFound(_) => None,
        }
    }

    pub fn into_found(self) -> Option<T> {
        match self {
            Detection::Found(v) => Some(v),
            Detection::NotFound(_) => None,
        }
    }

    #[inline]
    pub fn is_found(&self) -> bool {
        matches!(self, Detection::Found(_))
    }

    pub fn reason(&self) -> Option<&NotFoundReason> {
        match self {
            Detection::Found(_) => None,
            Detection::NotFound(r) => Some(r),
        }
    }
}

// ============================================================
// CANCELLATION
// ============================================================

/// Cooperative cancellation checked by the engine between stages
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also trips once `timeout` has elapsed
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================
// CONFIGURATION
// ============================================================

/// How the range window is chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WindowPolicy {
    /// [`Timeframe::range_window`]
    #[default]
    ByTimeframe,
    Fixed(Period),
}

impl WindowPolicy {
    pub fn window_for(self, timeframe: Timeframe) -> Period {
        match self {
            WindowPolicy::ByTimeframe => Period::new_const(timeframe.range_window()),
            WindowPolicy::Fixed(p) => p,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub range: RangeDetector,
    pub manipulation: ManipulationDetector,
    pub trendline: TrendlineFitter,
    pub levels: LevelDetector,
    pub window_policy: WindowPolicy,
    /// Shortest series the engine will analyse at all
    pub min_candles: usize,
    pub validate_data: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            range: RangeDetector::default(),
            manipulation: ManipulationDetector::default(),
            trendline: TrendlineFitter::default(),
            levels: LevelDetector::default(),
            window_policy: WindowPolicy::ByTimeframe,
            min_candles: 10,
            validate_data: true,
        }
    }
}

impl AnalysisConfig {
    /// Parse and validate a JSON config; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| AnalysisError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        to_json_string(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_candles == 0 {
            return Err(AnalysisError::InvalidValue("min_candles must be > 0"));
        }
        self.range.validate_config()?;
        self.manipulation.validate_config()?;
        self.trendline.validate_config()?;
        self.levels.validate_config()?;
        Ok(())
    }
}

// ============================================================
// REPORT
// ============================================================

pub(crate) fn to_json_string<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AnalysisError::Serialization(e.to_string()))
}

/// Everything one (symbol, timeframe) analysis found. Immutable once built.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Report {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candle_count: usize,
    pub range: Detection<Range>,
    /// `None` when no range box was measured
    pub manipulation: Option<ManipulationReport>,
    pub trendlines: TrendlineSet,
    pub projection: Detection<FibProjection>,
    pub levels: KeyLevels,
    pub bias: Direction,
    /// Set when the analysis could not run; every other field is then empty
    pub error: Option<AnalysisError>,
}

impl Report {
    pub fn failed(symbol: &str, timeframe: Timeframe, candle_count: usize, error: AnalysisError) -> Self {
        let reason = match &error {
            AnalysisError::InsufficientData { need, got } => {
                NotFoundReason::InsufficientData { need: *need, got: *got }
            },
            _ => NotFoundReason::AnalysisFailed,
        };
        Self {
            symbol: symbol.to_string(),
            timeframe,
            candle_count,
            range: Detection::NotFound(reason.clone()),
            manipulation: None,
            trendlines: TrendlineSet::not_found(reason.clone()),
            projection: Detection::NotFound(reason),
            levels: KeyLevels::default(),
            bias: Direction::Neutral,
            error: Some(error),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Canonical manipulation event, if one was confirmed
    pub fn manipulation_event(&self) -> Option<&ManipulationEvent> {
        self.manipulation.as_ref().and_then(|m| m.event.as_ref())
    }

    /// One line per section, for text front ends
    pub fn messages(&self) -> Vec<String> {
        if let Some(error) = &self.error {
            return vec![format!("[ERROR] {} ({}): {}", self.symbol, self.timeframe, error)];
        }

        let mut lines = vec![format!(
            "{} ({}) - {} candles, bias {:?}",
            self.symbol, self.timeframe, self.candle_count, self.bias
        )];
        lines.push(match &self.range {
            Detection::Found(r) => r.message(),
            Detection::NotFound(reason) => format!("No range: {reason}"),
        });
        lines.push(match &self.manipulation {
            Some(m) => m.message.clone(),
            None => "No range = manipulation detection skipped.".to_string(),
        });
        lines.push(self.trendlines.summary());
        lines.push(match &self.projection {
            Detection::Found(p) => p.message.clone(),
            Detection::NotFound(reason) => format!("No IRZ projected: {reason}"),
        });
        lines
    }

    pub fn to_json(&self) -> Result<String> {
        to_json_string(self)
    }
}

// ============================================================
// ANALYSIS ENGINE
// ============================================================

/// Runs range, manipulation, projection, trendline and level detection over
/// one series
#[derive(Debug, Clone)]
pub struct AnalysisEngine {
    config: AnalysisConfig,
    projection: ProjectionEngine,
}

impl AnalysisEngine {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, projection: ProjectionEngine })
    }

    #[inline]
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyse, turning every error into a failed [`Report`].
    pub fn analyze<T: OHLCV>(&self, symbol: &str, timeframe: Timeframe, bars: &[T]) -> Report {
        self.analyze_with(symbol, timeframe, bars, &CancelToken::new())
    }

    pub fn analyze_with<T: OHLCV>(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[T],
        cancel: &CancelToken,
    ) -> Report {
        self.try_analyze_with(symbol, timeframe, bars, cancel)
            .unwrap_or_else(|error| {
                tracing::warn!(symbol, %timeframe, %error, "analysis failed");
                Report::failed(symbol, timeframe, bars.len(), error)
            })
    }

    pub fn analyze_series(&self, symbol: &str, timeframe: Timeframe, series: &CandleSeries) -> Report {
        self.analyze(symbol, timeframe, series.as_slice())
    }

    pub fn try_analyze<T: OHLCV>(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[T],
    ) -> Result<Report> {
        self.try_analyze_with(symbol, timeframe, bars, &CancelToken::new())
    }

    /// Analyse one series, checking `cancel` between stages.
    ///
    /// Fails on series shorter than `min_candles`, on malformed bars, and on
    /// cancellation. Nothing-found outcomes land in the report.
    pub fn try_analyze_with<T: OHLCV>(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[T],
        cancel: &CancelToken,
    ) -> Result<Report> {
        if bars.len() < self.config.min_candles {
            return Err(AnalysisError::InsufficientData {
                need: self.config.min_candles,
                got: bars.len(),
            });
        }
        if self.config.validate_data {
            validate_bars(bars)?;
        }
        cancel.check()?;

        let window = self.config.window_policy.window_for(timeframe);
        let range = match self.config.range.with_window(window).detect(bars) {
            Ok(r) => Detection::Found(r),
            Err(AnalysisError::InsufficientData { need, got }) => {
                Detection::NotFound(NotFoundReason::InsufficientData { need, got })
            },
            Err(e) => return Err(e),
        };
        cancel.check()?;

        // Any measured box is tested; `is_range` only qualifies it.
        let manipulation = range.found().map(|r| self.config.manipulation.detect(bars, r));

        let projection = match (&range, &manipulation) {
            (Detection::Found(r), Some(m)) => self.projection.project(r, m.direction()),
            (Detection::NotFound(reason), _) => Detection::NotFound(reason.clone()),
            (Detection::Found(_), None) => Detection::NotFound(NotFoundReason::NoDirection),
        };
        let bias = projection
            .found()
            .map(|p| Direction::from(p.direction))
            .unwrap_or_default();
        cancel.check()?;

        let trendlines = self.config.trendline.fit_for_with(bars, timeframe, cancel)?;
        cancel.check()?;

        let levels = self.config.levels.detect(bars);

        tracing::info!(
            symbol,
            %timeframe,
            candles = bars.len(),
            range = range.is_found(),
            manipulated = manipulation.as_ref().is_some_and(|m| m.is_manipulated()),
            trendlines = trendlines.lines().count(),
            ?bias,
            "analysis complete"
        );

        Ok(Report {
            symbol: symbol.to_string(),
            timeframe,
            candle_count: bars.len(),
            range,
            manipulation,
            trendlines,
            projection,
            levels,
            bias,
            error: None,
        })
    }
}

// ============================================================
// BUILDER
// ============================================================

/// Builder for [`AnalysisEngine`]
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: AnalysisConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    pub fn range_detector(mut self, detector: RangeDetector) -> Self {
        self.config.range = detector;
        self
    }

    pub fn manipulation_detector(mut self, detector: ManipulationDetector) -> Self {
        self.config.manipulation = detector;
        self
    }

    pub fn trendline_fitter(mut self, fitter: TrendlineFitter) -> Self {
        self.config.trendline = fitter;
        self
    }

    pub fn level_detector(mut self, detector: LevelDetector) -> Self {
        self.config.levels = detector;
        self
    }

    /// Use `window` bars for the range regardless of timeframe
    pub fn fixed_window(mut self, window: Period) -> Self {
        self.config.window_policy = WindowPolicy::Fixed(window);
        self
    }

    pub fn min_candles(mut self, min: usize) -> Self {
        self.config.min_candles = min;
        self
    }

    /// Enable/disable bar validation
    pub fn validate_data(mut self, enable: bool) -> Self {
        self.config.validate_data = enable;
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<AnalysisEngine> {
        AnalysisEngine::new(self.config)
    }
}

// ============================================================
// PARALLEL ANALYSIS
// ============================================================

use rayon::prelude::*;

/// One independent analysis request
#[derive(Debug)]
pub struct AnalysisJob<'a, T> {
    pub symbol: &'a str,
    pub timeframe: Timeframe,
    pub bars: &'a [T],
}

impl<'a, T> Clone for AnalysisJob<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for AnalysisJob<'a, T> {}

/// Error from analysing a single job
#[derive(Debug)]
pub struct AnalysisFailure {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub error: AnalysisError,
}

/// Analyse independent jobs on at most `max_workers` threads.
pub fn analyze_parallel<'a, T>(
    engine: &AnalysisEngine,
    jobs: Vec<AnalysisJob<'a, T>>,
    max_workers: usize,
) -> Result<(Vec<Report>, Vec<AnalysisFailure>)>
where
    T: OHLCV + Sync + 'a,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_workers.max(1))
        .build()
        .map_err(|e| AnalysisError::InvalidConfig(e.to_string()))?;

    let results: Vec<_> = pool.install(|| {
        jobs.into_par_iter()
            .map(|job| {
                engine
                    .try_analyze(job.symbol, job.timeframe, job.bars)
                    .map_err(|error| AnalysisFailure {
                        symbol: job.symbol.to_string(),
                        timeframe: job.timeframe,
                        error,
                    })
            })
            .collect()
    });

    let mut reports = Vec::new();
    let mut failures = Vec::new();

    for result in results {
        match result {
            Ok(r) => reports.push(r),
            Err(e) => failures.push(e),
        }
    }

    Ok((reports, failures))
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Test OHLCV bar without timestamps
    #[derive(Debug, Clone)]
    struct Bar {
        o: f64,
        h: f64,
        l: f64,
        c: f64,
    }

    impl Bar {
        fn new(o: f64, h: f64, l: f64, c: f64) -> Self {
            Self { o, h, l, c }
        }
    }

    impl OHLCV for Bar {
        fn open(&self) -> f64 {
            self.o
        }

        fn high(&self) -> f64 {
            self.h
        }

        fn low(&self) -> f64 {
            self.l
        }

        fn close(&self) -> f64 {
            self.c
        }

        fn volume(&self) -> f64 {
            1000.0
        }
    }

    /// Bars alternating between 99 and 101, one stop hunt above at `spike`
    fn ranging_with_spike(n: usize, spike: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                if i == spike {
                    Bar::new(100.5, 104.0, 100.0, 100.0)
                } else if i % 2 == 0 {
                    Bar::new(99.0, 101.0, 99.0, 101.0)
                } else {
                    Bar::new(101.0, 101.0, 99.0, 99.0)
                }
            })
            .collect()
    }

    #[test]
    fn test_ratio_validation() {
        assert!(Ratio::new(0.0).is_ok());
        assert!(Ratio::new(1.0).is_ok());
        assert!(Ratio::new(-0.1).is_err());
        assert!(Ratio::new(1.1).is_err());
        assert!(Ratio::new(f64::NAN).is_err());
        assert!(Ratio::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_period_validation() {
        assert!(Period::new(1).is_ok());
        assert!(Period::new(0).is_err());
    }

    #[test]
    fn test_ohlcv_ext() {
        let bar = Bar::new(100.0, 110.0, 90.0, 105.0);
        assert_eq!(bar.body(), 5.0);
        assert_eq!(bar.body_high(), 105.0);
        assert_eq!(bar.body_low(), 100.0);
        assert_eq!(bar.range(), 20.0);
        assert_eq!(bar.upper_shadow(), 5.0);
        assert_eq!(bar.lower_shadow(), 10.0);
        assert!(bar.is_bullish());
        assert_eq!(bar.true_range(None), 20.0);
        assert_eq!(bar.true_range(Some(120.0)), 30.0);
    }

    #[test]
    fn test_candle_validation() {
        assert!(Bar::new(100.0, 101.0, 99.0, 100.5).validate().is_ok());
        assert!(Bar::new(100.0, 99.0, 101.0, 100.0).validate().is_err());
        assert!(Bar::new(100.0, 101.0, 99.0, 102.0).validate().is_err());
        assert!(Bar::new(f64::NAN, 101.0, 99.0, 100.0).validate().is_err());
    }

    #[test]
    fn test_validate_bars_reports_index() {
        let bars = vec![
            Candle::new(1, 100.0, 101.0, 99.0, 100.0, 1.0),
            Candle::new(2, 100.0, 101.0, 99.0, 100.0, -1.0),
        ];
        assert_eq!(
            validate_bars(&bars),
            Err(AnalysisError::InvalidCandle { index: 1, reason: "negative volume" })
        );

        let bars = vec![
            Candle::new(5, 100.0, 101.0, 99.0, 100.0, 1.0),
            Candle::new(5, 100.0, 101.0, 99.0, 100.0, 1.0),
        ];
        assert_eq!(validate_bars(&bars), Err(AnalysisError::NonMonotonicTimestamp { index: 1 }));
    }

    #[test]
    fn test_candle_series() {
        let series = CandleSeries::from_ohlcv(&ranging_with_spike(12, 5)).unwrap();
        assert_eq!(series.len(), 12);
        assert_eq!(series[3].timestamp, 3);

        let bad = vec![
            Candle::new(2, 100.0, 101.0, 99.0, 100.0, 1.0),
            Candle::new(1, 100.0, 101.0, 99.0, 100.0, 1.0),
        ];
        assert!(CandleSeries::new(bad).is_err());
    }

    #[test]
    fn test_timeframe_tables() {
        assert_eq!("15min".parse::<Timeframe>().unwrap().range_window(), 96);
        assert_eq!("15m".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert_eq!(Timeframe::M30.range_window(), 48);
        assert_eq!(Timeframe::H1.range_window(), 50);
        assert_eq!(Timeframe::H4.range_window(), 30);
        assert_eq!(Timeframe::D1.range_window(), 15);
        assert_eq!(Timeframe::M5.range_window(), 50);
        assert_eq!(Timeframe::H1.classification_bars(), 360);
        assert_eq!(Timeframe::W1.classification_bars(), 15);
        assert!("2h".parse::<Timeframe>().is_err());
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn test_breakout_direction_parse() {
        assert_eq!("Up".parse::<BreakoutDirection>().unwrap(), BreakoutDirection::Up);
        assert_eq!(BreakoutDirection::Down.opposite(), BreakoutDirection::Up);
        assert!(matches!(
            "left".parse::<BreakoutDirection>(),
            Err(AnalysisError::InvalidDirection(_))
        ));
        assert_eq!(Direction::from(BreakoutDirection::Down), Direction::Bearish);
    }

    #[test]
    fn test_engine_builder() {
        assert!(EngineBuilder::new().build().is_ok());
        assert!(EngineBuilder::new().min_candles(0).build().is_err());
    }

    #[test]
    fn test_empty_series_fails() {
        let engine = EngineBuilder::new().build().unwrap();
        let bars: Vec<Bar> = vec![];
        assert_eq!(
            engine.try_analyze("ES", Timeframe::H1, &bars).unwrap_err(),
            AnalysisError::InsufficientData { need: 10, got: 0 }
        );
        let report = engine.analyze("ES", Timeframe::H1, &bars);
        assert!(!report.is_ok());
        assert!(report.manipulation.is_none());
        assert_eq!(report.bias, Direction::Neutral);
    }

    #[test]
    fn test_short_series_reports_no_range() {
        let engine = EngineBuilder::new().build().unwrap();
        let bars = ranging_with_spike(20, 100);
        let report = engine.try_analyze("ES", Timeframe::H1, &bars).unwrap();
        assert_eq!(
            report.range,
            Detection::NotFound(NotFoundReason::InsufficientData { need: 50, got: 20 })
        );
        assert!(report.manipulation.is_none());
        assert_eq!(report.bias, Direction::Neutral);
    }

    #[test]
    fn test_full_analysis_bearish_after_stop_hunt_up() {
        let engine = EngineBuilder::new().build().unwrap();
        let bars = ranging_with_spike(60, 55);
        let report = engine.try_analyze("ES", Timeframe::H1, &bars).unwrap();

        let range = report.range.found().unwrap();
        assert!(range.is_range);
        assert_eq!((range.low, range.high), (99.0, 101.0));

        let event = report.manipulation_event().unwrap();
        assert_eq!(event.direction, BreakoutDirection::Up);
        assert_eq!(event.index, 55);
        assert_eq!(event.breakout_price, 104.0);

        let fib = report.projection.found().unwrap();
        assert_eq!(fib.direction, BreakoutDirection::Down);
        assert_eq!(report.bias, Direction::Bearish);
        assert!(report.messages().len() >= 5);
        assert!(report.to_json().unwrap().contains("\"bias\":\"Bearish\""));
    }

    #[test]
    fn test_fixed_window_overrides_timeframe() {
        let engine = EngineBuilder::new().fixed_window(Period::new(20).unwrap()).build().unwrap();
        let bars = ranging_with_spike(30, 100);
        let report = engine.try_analyze("ES", Timeframe::D1, &bars).unwrap();
        assert_eq!(report.range.found().unwrap().window, 20);
    }

    #[test]
    fn test_invalid_bars_become_report_error() {
        let engine = EngineBuilder::new().build().unwrap();
        let mut bars = ranging_with_spike(30, 100);
        bars[7] = Bar::new(100.0, 99.0, 101.0, 100.0);
        let report = engine.analyze("ES", Timeframe::H1, &bars);
        assert_eq!(
            report.error,
            Some(AnalysisError::InvalidCandle { index: 7, reason: "high < low" })
        );
        assert!(report.error.as_ref().unwrap().is_contract_violation());
        assert!(report.messages()[0].starts_with("[ERROR]"));
        assert_eq!(report.range, Detection::NotFound(NotFoundReason::AnalysisFailed));
        assert_eq!(report.projection, Detection::NotFound(NotFoundReason::AnalysisFailed));
        assert_eq!(
            report.trendlines.support,
            Detection::NotFound(NotFoundReason::AnalysisFailed)
        );
    }

    #[test]
    fn test_failed_report_keeps_insufficient_reason() {
        let report = Report::failed(
            "ES",
            Timeframe::H1,
            3,
            AnalysisError::InsufficientData { need: 10, got: 3 },
        );
        assert_eq!(
            report.range,
            Detection::NotFound(NotFoundReason::InsufficientData { need: 10, got: 3 })
        );

        let report = Report::failed("ES", Timeframe::H1, 60, AnalysisError::Cancelled);
        assert_eq!(report.range, Detection::NotFound(NotFoundReason::AnalysisFailed));
        assert_eq!(report.error, Some(AnalysisError::Cancelled));
    }

    #[test]
    fn test_serialization_errors_are_not_config_errors() {
        let mut keyed = std::collections::HashMap::new();
        keyed.insert((1, 2), 3);
        assert!(matches!(to_json_string(&keyed), Err(AnalysisError::Serialization(_))));

        let json = AnalysisConfig::default().to_json().unwrap();
        assert_eq!(AnalysisConfig::from_json(&json).unwrap(), AnalysisConfig::default());
    }

    #[test]
    fn test_cancelled_token() {
        let engine = EngineBuilder::new().build().unwrap();
        let bars = ranging_with_spike(60, 55);
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(
            engine.try_analyze_with("ES", Timeframe::H1, &bars, &token).unwrap_err(),
            AnalysisError::Cancelled
        );
        let expired = CancelToken::with_timeout(Duration::ZERO);
        assert!(expired.is_cancelled());
    }

    #[test]
    fn test_config_from_json() {
        let config = AnalysisConfig::from_json(
            r#"{ "range": { "min_bounces": 2 }, "window_policy": { "Fixed": 30 } }"#,
        )
        .unwrap();
        assert_eq!(config.range.min_bounces, 2);
        assert_eq!(config.range.atr_multiplier, 3.0);
        assert_eq!(config.window_policy, WindowPolicy::Fixed(Period::new(30).unwrap()));
        assert_eq!(config.min_candles, 10);

        assert!(AnalysisConfig::from_json(r#"{ "range": { "tolerance_pct": 2.0 } }"#).is_err());
        assert!(AnalysisConfig::from_json(r#"{ "min_candles": 0 }"#).is_err());
    }

    #[test]
    fn test_parallel_analysis() {
        let engine = EngineBuilder::new().build().unwrap();
        let good = ranging_with_spike(60, 55);
        let short = ranging_with_spike(5, 100);

        let jobs = vec![
            AnalysisJob { symbol: "ES", timeframe: Timeframe::H1, bars: &good[..] },
            AnalysisJob { symbol: "NQ", timeframe: Timeframe::H4, bars: &good[..] },
            AnalysisJob { symbol: "CL", timeframe: Timeframe::H1, bars: &short[..] },
        ];

        let (reports, failures) = analyze_parallel(&engine, jobs, 2).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].symbol, "CL");
    }
}
