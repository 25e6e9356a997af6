//! # Correlation Core
//!
//! The per-worker half of the fxcorr correlator: a cooperative pipeline that
//! turns raw station samples into time-integrated baseline products.
//!
//! ## Features
//!
//! - [`CorrelationEngine`]: frame assembly, delay correction and correlation
//!   tasklets driven by an explicit, non-preemptive driver loop
//! - [`BufferPool`]: fixed arena of frame buffers addressed by [`SlotId`]
//! - Pulsar phase binning and flagged-frame weighting
//!
//! The crate is synchronous; the worker node feeds it samples and drives it.

use thiserror::Error;

pub mod baseline;
pub mod buffer_pool;
pub mod engine;
pub mod params;
pub mod pulsar;
pub mod record;

pub use baseline::{Baseline, Polarisation, StreamSpec, baselines};
pub use buffer_pool::{BufferPool, BufferPoolStats, SlotId};
pub use engine::{CorrelationEngine, StreamInput, Tasklet};
pub use params::{ChannelGeometry, CorrelationParameters};
pub use pulsar::{PulsarFolding, PulsarModel};
pub use record::{BaselineProduct, OutputRecord};

use delay_model::DelayError;

/// Errors raised by the worker pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CorrelationError {
    #[error("stream {stream} ended early: {available} samples left, {needed} needed")]
    StreamUnderrun {
        stream: usize,
        needed: usize,
        available: usize,
    },

    #[error("delay correction failed on stream {stream}: {source}")]
    Delay {
        stream: usize,
        #[source]
        source: DelayError,
    },

    #[error("invalid correlation parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown stream {0}")]
    UnknownStream(usize),

    #[error("stream {0} already ended")]
    StreamClosed(usize),
}
