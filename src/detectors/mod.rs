//! Market-structure detectors
//!
//! Each detector is a plain config struct with a `detect`/`fit`/`project`
//! method over an `OHLCV` slice.
//!
//! # Stages
//!
//! - **Range**: consolidation box from body extremes of the trailing window
//! - **Manipulation**: breakout beyond the box that closes back inside
//! - **Projection**: fibonacci levels against the manipulation
//! - **Trendline**: robust lines through swing pivots, classified by role
//! - **Levels**: horizontal support / resistance from rolling windows

pub mod helpers;

/// Generate `with_defaults()` -> `Self::default()` for multiple detector types.
macro_rules! impl_with_defaults {
  ($($detector:ty),* $(,)?) => {
    $(impl $detector {
      pub fn with_defaults() -> Self { Self::default() }
    })*
  };
}

pub mod levels;
pub mod manipulation;
pub mod projection;
pub mod range;
pub mod trendline;

impl_with_defaults!(
  range::RangeDetector,
  manipulation::ManipulationDetector,
  trendline::TrendlineFitter,
  levels::LevelDetector,
  projection::ProjectionEngine,
);

// Re-export all detectors for convenience
pub use helpers::*;
pub use levels::*;
pub use manipulation::*;
pub use projection::*;
pub use range::*;
pub use trendline::*;
