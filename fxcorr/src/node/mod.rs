//! Correlator nodes: station inputs, correlation workers and the output
//! aggregator. Each node is a task that owns its inbox and stops on an
//! explicit stop message or cancellation.

pub mod output;
pub mod station;
pub mod transport;
pub mod worker;

pub use output::{GlobalHeader, OutputLayout, OutputNode};
pub use station::{SampleRequest, SampleSource, StationNode, SyntheticSource};
pub use transport::{TransportDirectory, TransportDirectoryBuilder};
pub use worker::WorkerNode;

/// How a node's run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Stopped on a stop message or a closed inbox.
    Stopped,
    /// Stopped by its cancellation token.
    Cancelled,
}

pub type NodeResult = crate::Result<NodeOutcome>;
