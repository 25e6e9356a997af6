//! Application-wide error types.

use correlation_core::CorrelationError;
use delay_model::DelayError;
use thiserror::Error;

use crate::config::ConfigError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error on worker {worker_id}: {reason}")]
    Connection { worker_id: usize, reason: String },

    #[error("No correlation worker is available")]
    NoWorkers,

    #[error("Scheduler invariant violated: {0}")]
    SchedulerInvariant(String),

    #[error("Node stopped: {0}")]
    NodeStopped(String),

    #[error("Delay model error: {0}")]
    Delay(#[from] DelayError),

    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn connection(worker_id: usize, reason: impl Into<String>) -> Self {
        Self::Connection {
            worker_id,
            reason: reason.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::SchedulerInvariant(msg.into())
    }

    pub fn node_stopped(node: impl Into<String>) -> Self {
        Self::NodeStopped(node.into())
    }

    /// Errors that end the whole run, as opposed to failing a single job.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Correlation(_) | Error::Delay(_))
    }
}
