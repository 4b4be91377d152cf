//! Property tests over randomly generated, well-formed candle series.

use proptest::prelude::*;
use rangehunter::detectors::{
    BreakoutTrigger, ManipulationDetector, ProjectionEngine, Range, RangeDetector, TouchCounts,
    TrendlineFitter, FIB_RATIOS,
};
use rangehunter::{BreakoutDirection, Candle, Direction, EngineBuilder, Timeframe};

/// (base, body move, upper wick, lower wick) per bar
fn candles() -> impl Strategy<Value = Vec<Candle>> {
    prop::collection::vec((90.0f64..110.0, -2.0f64..2.0, 0.0f64..3.0, 0.0f64..3.0), 50..160).prop_map(
        |raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (open, delta, up, down))| {
                    let close = open + delta;
                    let high = open.max(close) + up;
                    let low = open.min(close) - down;
                    Candle::new(i as i64 * 3_600, open, high, low, close, 1_000.0)
                })
                .collect()
        },
    )
}

proptest! {
    #[test]
    fn range_bounds_are_ordered(bars in candles()) {
        let range = RangeDetector::default().detect(&bars).unwrap();
        prop_assert!(range.low <= range.high);
        prop_assert!(range.window <= bars.len());
        prop_assert_eq!(range.start_index + range.window, bars.len());
    }

    #[test]
    fn manipulation_events_sit_outside_then_return(bars in candles()) {
        let range = RangeDetector::default().detect(&bars).unwrap();
        for trigger in [BreakoutTrigger::Wick, BreakoutTrigger::Close] {
            let detector = ManipulationDetector { trigger, ..Default::default() };
            let report = detector.detect(&bars, &range);
            for event in &report.confirmed {
                prop_assert!(!range.contains(event.breakout_price));
                prop_assert!(event.deviation > 0.0);
                prop_assert!(range.contains(event.return_close));
                prop_assert!(event.return_index >= event.index);
            }
            if report.is_manipulated() {
                prop_assert!(report.event.is_some());
                prop_assert!(report.pending.is_none());
            }
        }
    }

    #[test]
    fn manipulation_scan_is_deterministic(bars in candles()) {
        let range = RangeDetector::default().detect(&bars).unwrap();
        let detector = ManipulationDetector::default();
        let first = serde_json::to_string(&detector.detect(&bars, &range)).unwrap();
        let second = serde_json::to_string(&detector.detect(&bars, &range)).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn fib_levels_follow_formula(low in 1.0f64..1_000.0, width in 0.0f64..100.0, up in any::<bool>()) {
        let range = Range {
            low,
            high: low + width,
            window: 50,
            start_index: 0,
            touches: TouchCounts::default(),
            atr: 1.0,
            is_tight: true,
            is_range: true,
        };
        let direction = if up { BreakoutDirection::Up } else { BreakoutDirection::Down };
        let fib = ProjectionEngine.project(&range, Some(direction)).into_found().unwrap();
        let mirrored = ProjectionEngine.project(&range, Some(direction.opposite())).into_found().unwrap();

        prop_assert_eq!(fib.levels.len(), FIB_RATIOS.len());
        for level in &fib.levels {
            prop_assert_eq!(level.price, fib.anchor0 + (fib.anchor1 - fib.anchor0) * level.ratio);
        }
        prop_assert_eq!((fib.anchor0, fib.anchor1), (mirrored.anchor1, mirrored.anchor0));
    }

    #[test]
    fn trendlines_meet_their_thresholds(bars in candles()) {
        let fitter = TrendlineFitter::default();
        let set = fitter.fit(&bars, 50);
        for line in set.lines() {
            prop_assert!(line.points.len() >= fitter.min_points);
            prop_assert!(line.correlation.abs() >= fitter.min_correlation.get());
            prop_assert!(line.role.is_active());
            prop_assert!(line.points.windows(2).all(|w| w[0].index < w[1].index));
        }
    }

    #[test]
    fn engine_never_fails_on_valid_series(bars in candles()) {
        let engine = EngineBuilder::new().build().unwrap();
        let report = engine.try_analyze("PROP", Timeframe::H1, &bars).unwrap();
        prop_assert_eq!(report.candle_count, bars.len());
        if report.bias != Direction::Neutral {
            prop_assert!(report.manipulation.as_ref().is_some_and(|m| m.is_manipulated()));
        }
    }
}
