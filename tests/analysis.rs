//! Integration tests for the rangehunter analysis library.
//!
//! These tests drive the detectors and the engine through the public API.

use std::time::Duration;

use rangehunter::prelude::*;

/// Simple test bar structure, no timestamps
#[derive(Debug, Clone, Copy)]
struct TestBar {
    o: f64,
    h: f64,
    l: f64,
    c: f64,
}

impl TestBar {
    fn new(o: f64, h: f64, l: f64, c: f64) -> Self {
        Self { o, h, l, c }
    }
}

impl OHLCV for TestBar {
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

/// Flat candles at 100 with one wick spike up to 110 closing at 99 on bar 55
fn make_flat_with_spike() -> Vec<Candle> {
    (0..60)
        .map(|i| {
            if i == 55 {
                Candle::new(i, 100.0, 110.0, 99.0, 99.0, 1.0)
            } else {
                Candle::new(i, 100.0, 100.0, 100.0, 100.0, 1.0)
            }
        })
        .collect()
}

/// Generate rising bars with no wicks beyond the body
fn make_uptrend(n: usize) -> Vec<TestBar> {
    (0..n)
        .map(|i| {
            let o = 100.0 + i as f64;
            TestBar::new(o, o + 1.0, o, o + 1.0)
        })
        .collect()
}

/// Bars alternating between 99 and 101 with an optional replacement bar
fn make_ranging(n: usize, spike: Option<(usize, TestBar)>) -> Vec<TestBar> {
    (0..n)
        .map(|i| match spike {
            Some((at, bar)) if at == i => bar,
            _ if i % 2 == 0 => TestBar::new(99.0, 101.0, 99.0, 101.0),
            _ => TestBar::new(101.0, 101.0, 99.0, 99.0),
        })
        .collect()
}

fn engine() -> AnalysisEngine {
    EngineBuilder::new().build().unwrap()
}

// ============================================================
// DETECTOR SCENARIOS
// ============================================================

#[test]
fn test_stop_hunt_scenario_detector_by_detector() {
    let bars = make_flat_with_spike();

    let range = RangeDetector::default().detect(&bars).unwrap();
    assert_eq!(range.low, 99.0);
    assert_eq!(range.high, 100.0);
    assert_eq!(range.window, 50);

    let report = ManipulationDetector::default().detect(&bars, &range);
    assert_eq!(report.status, ManipulationStatus::Manipulated);
    assert_eq!(report.confirmed.len(), 1);
    let event = report.event.unwrap();
    assert_eq!(event.direction, BreakoutDirection::Up);
    assert_eq!(event.index, 55);
    assert!(event.return_confirmed);
    assert!(!range.contains(event.breakout_price));

    let fib = ProjectionEngine.project_label(&range, "up").into_found().unwrap();
    assert_eq!(fib.direction, BreakoutDirection::Down);
    let far = fib.level(1.0).unwrap().price;
    for level in fib.retracement_zone() {
        assert!(level.price > fib.anchor0 && level.price < far);
    }
    assert_eq!(
        fib.retracement_zone()[0].price,
        fib.anchor0 + (fib.anchor1 - fib.anchor0) * 0.618
    );
}

#[test]
fn test_rising_series_never_manipulated() {
    let bars = make_uptrend(80);
    let range = RangeDetector::default().detect(&bars).unwrap();
    assert!(!range.is_range);

    let engine = engine();
    for _ in 0..3 {
        let report = engine.analyze("ES", Timeframe::H1, &bars);
        assert!(report.is_ok());
        let manipulation = report.manipulation.as_ref().unwrap();
        assert_eq!(manipulation.status, ManipulationStatus::Clean);
        assert!(manipulation.confirmed.is_empty());
        assert_eq!(report.projection, Detection::NotFound(NotFoundReason::NoDirection));
        assert_eq!(report.bias, Direction::Neutral);
    }
}

#[test]
fn test_range_window_boundary() {
    let detector = RangeDetector::default().with_window(Period::new(20).unwrap());
    assert!(detector.detect(&make_uptrend(20)).is_ok());
    assert_eq!(
        detector.detect(&make_uptrend(19)).unwrap_err(),
        AnalysisError::InsufficientData { need: 20, got: 19 }
    );
}

#[test]
fn test_mirrored_projection_anchors() {
    let bars = make_flat_with_spike();
    let range = RangeDetector::default().detect(&bars).unwrap();

    let up = ProjectionEngine.project(&range, Some(BreakoutDirection::Up)).into_found().unwrap();
    let down = ProjectionEngine.project(&range, Some(BreakoutDirection::Down)).into_found().unwrap();
    assert_eq!((up.anchor0, up.anchor1), (down.anchor1, down.anchor0));
    assert_eq!(up.direction, down.direction.opposite());
}

// ============================================================
// ENGINE
// ============================================================

#[test]
fn test_stop_hunt_scenario_through_engine() {
    let bars = make_flat_with_spike();
    let report = engine().try_analyze("ES", Timeframe::H1, &bars).unwrap();

    // one lower touch on a near-zero ATR: a box, but not a qualified range
    let range = report.range.found().unwrap();
    assert_eq!((range.low, range.high), (99.0, 100.0));
    assert_eq!(range.start_index, 10);
    assert!(!range.is_range);

    let manipulation = report.manipulation.as_ref().unwrap();
    assert_eq!(manipulation.status, ManipulationStatus::Manipulated);
    assert_eq!(manipulation.confirmed.len(), 1);
    let event = report.manipulation_event().unwrap();
    assert_eq!(event.direction, BreakoutDirection::Up);
    assert_eq!(event.index, 55);
    assert_eq!(event.breakout_price, 110.0);
    assert!(event.return_confirmed);

    let fib = report.projection.found().unwrap();
    assert_eq!(fib.direction, BreakoutDirection::Down);
    assert_eq!(report.bias, Direction::Bearish);
    assert!(report.messages().iter().any(|m| m.starts_with("Manipulation detected")));
}

#[test]
fn test_engine_bearish_after_upside_hunt() {
    let bars = make_ranging(60, Some((55, TestBar::new(100.5, 104.0, 100.0, 100.0))));
    let report = engine().try_analyze("ES", Timeframe::H1, &bars).unwrap();

    assert!(report.range.found().unwrap().is_range);
    assert_eq!(report.manipulation_event().unwrap().direction, BreakoutDirection::Up);
    assert_eq!(report.projection.found().unwrap().direction, BreakoutDirection::Down);
    assert_eq!(report.bias, Direction::Bearish);
    assert_eq!(report.trendlines.lines().count(), 0);
    assert!(!report.levels.support.is_empty());
}

#[test]
fn test_engine_bullish_after_downside_hunt() {
    let bars = make_ranging(60, Some((55, TestBar::new(99.5, 100.0, 96.0, 100.0))));
    let report = engine().try_analyze("ES", Timeframe::H1, &bars).unwrap();

    let event = report.manipulation_event().unwrap();
    assert_eq!(event.direction, BreakoutDirection::Down);
    assert_eq!(event.breakout_price, 96.0);
    assert_eq!(report.bias, Direction::Bullish);
}

#[test]
fn test_engine_neutral_without_breakout() {
    let bars = make_ranging(60, None);
    let report = engine().try_analyze("ES", Timeframe::H1, &bars).unwrap();
    let manipulation = report.manipulation.as_ref().unwrap();
    assert_eq!(manipulation.status, ManipulationStatus::Clean);
    assert_eq!(report.projection, Detection::NotFound(NotFoundReason::NoDirection));
    assert_eq!(report.bias, Direction::Neutral);
}

#[test]
fn test_minimum_viable_length() {
    let engine = engine();
    let nine = make_uptrend(9);
    assert_eq!(
        engine.try_analyze("ES", Timeframe::H1, &nine).unwrap_err(),
        AnalysisError::InsufficientData { need: 10, got: 9 }
    );
    let failed = engine.analyze("ES", Timeframe::H1, &nine);
    assert!(failed.error.is_some());
    assert!(failed.trendlines.lines().next().is_none());

    let ten = make_uptrend(10);
    let report = engine.try_analyze("ES", Timeframe::H1, &ten).unwrap();
    assert!(!report.range.is_found());
}

#[test]
fn test_contract_violations() {
    let engine = engine();

    let mut bars = make_ranging(30, None);
    bars[12] = TestBar::new(100.0, 100.5, 99.0, 101.0);
    assert_eq!(
        engine.try_analyze("ES", Timeframe::H1, &bars).unwrap_err(),
        AnalysisError::InvalidCandle { index: 12, reason: "body outside high/low" }
    );

    let mut candles = make_flat_with_spike();
    candles[20].timestamp = candles[19].timestamp;
    assert_eq!(
        engine.try_analyze("ES", Timeframe::H1, &candles).unwrap_err(),
        AnalysisError::NonMonotonicTimestamp { index: 20 }
    );

    let lenient = EngineBuilder::new().validate_data(false).build().unwrap();
    assert!(lenient.try_analyze("ES", Timeframe::H1, &candles).is_ok());
}

#[test]
fn test_report_is_deterministic() {
    let engine = engine();
    let bars = make_ranging(120, Some((100, TestBar::new(100.5, 104.0, 100.0, 100.0))));

    let first = engine.analyze("ES", Timeframe::M15, &bars).to_json().unwrap();
    let second = engine.analyze("ES", Timeframe::M15, &bars).to_json().unwrap();
    assert_eq!(first, second);

    let range = RangeDetector::default().detect(&bars).unwrap();
    let a = serde_json::to_vec(&ManipulationDetector::default().detect(&bars, &range)).unwrap();
    let b = serde_json::to_vec(&ManipulationDetector::default().detect(&bars, &range)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_cancellation() {
    let engine = engine();
    let bars = make_ranging(60, None);

    let token = CancelToken::with_timeout(Duration::ZERO);
    let report = engine.analyze_with("ES", Timeframe::H1, &bars, &token);
    assert_eq!(report.error, Some(AnalysisError::Cancelled));

    let token = CancelToken::with_timeout(Duration::from_secs(3600));
    assert!(engine.try_analyze_with("ES", Timeframe::H1, &bars, &token).is_ok());
}

#[test]
fn test_large_minute_series_completes() {
    let bars: Vec<TestBar> = (0..10_000)
        .map(|i| {
            let o = 100.0 + ((i * 7919) % 113) as f64 * 0.05;
            let c = o + ((i * 31) % 7) as f64 * 0.1 - 0.3;
            TestBar::new(o, o.max(c) + 0.2, o.min(c) - 0.2, c)
        })
        .collect();
    let engine = engine();

    let report = engine.try_analyze("ES", Timeframe::M1, &bars).unwrap();
    assert_eq!(report.candle_count, 10_000);

    let token = CancelToken::new();
    token.cancel();
    assert_eq!(
        engine.try_analyze_with("ES", Timeframe::M1, &bars, &token).unwrap_err(),
        AnalysisError::Cancelled
    );
}

#[test]
fn test_parallel_matches_sequential() {
    let engine = engine();
    let series: Vec<Vec<TestBar>> = (0..8)
        .map(|k| make_ranging(60 + k * 5, Some((50 + k, TestBar::new(100.5, 104.0, 100.0, 100.0)))))
        .collect();
    let symbols = ["A", "B", "C", "D", "E", "F", "G", "H"];

    let jobs: Vec<AnalysisJob<'_, TestBar>> = series
        .iter()
        .zip(symbols)
        .map(|(bars, symbol)| AnalysisJob { symbol, timeframe: Timeframe::H1, bars })
        .collect();

    let (reports, failures) = analyze_parallel(&engine, jobs.clone(), 3).unwrap();
    assert!(failures.is_empty());
    assert_eq!(reports.len(), 8);

    for (job, report) in jobs.iter().zip(&reports) {
        assert_eq!(report, &engine.analyze(job.symbol, job.timeframe, job.bars));
    }
}

// ============================================================
// SCHEMA AND CONFIG
// ============================================================

#[test]
fn test_candle_series_from_json() {
    let json = r#"[
        {"timestamp": 1, "open": 100.0, "high": 101.0, "low": 99.0, "close": 100.5, "volume": 10.0},
        {"timestamp": 2, "open": 100.5, "high": 102.0, "low": 100.0, "close": 101.0, "volume": 12.0}
    ]"#;
    let series: CandleSeries = serde_json::from_str(json).unwrap();
    assert_eq!(series.len(), 2);
    assert_eq!(series[1].close, 101.0);

    let broken = r#"[{"timestamp": 1, "open": 100.0, "high": 99.0, "low": 101.0, "close": 100.0, "volume": 1.0}]"#;
    assert!(serde_json::from_str::<CandleSeries>(broken).is_err());
}

#[test]
fn test_config_json_round_trip() {
    let config = AnalysisConfig::default();
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(AnalysisConfig::from_json(&json).unwrap(), config);
    assert_eq!(AnalysisConfig::from_json("{}").unwrap(), config);
}

#[test]
fn test_messages_cover_each_section() {
    let bars = make_ranging(60, Some((55, TestBar::new(100.5, 104.0, 100.0, 100.0))));
    let messages = engine().analyze("ES", Timeframe::H1, &bars).messages();
    assert!(messages.iter().any(|m| m.starts_with("Range (body-only)")));
    assert!(messages.iter().any(|m| m.starts_with("Manipulation detected")));
    assert!(messages.iter().any(|m| m.starts_with("IRZ levels")));
}
