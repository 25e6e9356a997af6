//! Distributed FX correlator.
//!
//! A [`ManagerScheduler`](scheduler::ManagerScheduler) walks the experiment
//! in integration-length time slices, expands each slice into correlation
//! jobs and hands them to ready workers. Station nodes stream the samples of
//! every job to its worker, workers run the correlation pipeline from
//! `correlation-core` and the output node writes the records in slice order.
//!
//! [`Correlator`] wires all of this together in one process.

pub mod config;
pub mod correlator;
pub mod error;
pub mod logging;
pub mod node;
pub mod scheduler;

pub use correlator::Correlator;
pub use error::{Error, Result};
