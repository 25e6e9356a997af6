//! # Delay Model
//!
//! Geometric delay bookkeeping and the delay-correction kernel used by the
//! fxcorr worker pipeline.
//!
//! - [`Time`]: integer-microsecond time base.
//! - [`DelayTable`]: per-station `(time, delay)` samples split into segments by
//!   scan breaks, interpolated with an Akima spline, plus a station clock model.
//! - [`DelayKernel`]: turns one frame of raw samples into a delay-corrected
//!   complex spectrum. [`FftDelayKernel`] is the default implementation.

use thiserror::Error;

mod akima;
pub mod kernel;
pub mod table;
pub mod time;

pub use akima::AkimaSpline;
pub use kernel::{DelayKernel, FftDelayKernel, SampleWindow};
pub use table::{ClockModel, DelaySegment, DelayTable, MIN_POINTS_PER_SEGMENT};
pub use time::{MICROS_PER_SECOND, Time};

/// Re-exported so callers do not need a direct `num-complex` dependency.
pub use num_complex::Complex32;

/// Errors raised while building or evaluating delay models.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DelayError {
    #[error("delay segment {segment} has {points} points, at least {min} are required")]
    TooFewPoints {
        segment: usize,
        points: usize,
        min: usize,
    },

    #[error("delay table times must be strictly increasing (segment {segment}, row {row})")]
    NotMonotonic { segment: usize, row: usize },

    #[error("time {time} is not covered by any delay segment")]
    OutOfRange { time: Time },

    #[error("delay table parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("delay table is empty")]
    Empty,

    #[error("invalid frame: expected {expected} samples, got {actual}")]
    FrameLength { expected: usize, actual: usize },

    #[error("FFT failed: {0}")]
    Fft(String),
}

impl DelayError {
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }
}
