//! In-process bulk transport: named endpoints backed by bounded channels.
//!
//! Every node gets a clone of the directory. A link owner resolves the
//! endpoint named in its connection-setup message and keeps the sender.
//! Sample links are opened per station: the worker receives the far end
//! through its inbox and stops reading it while the stream queues are full,
//! so the station blocks on the bounded link.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::scheduler::messages::{DataChunk, OutputMessage, SampleLink, WorkerInput};

/// Chunks a sample link buffers before the station waits.
pub const SAMPLE_LINK_CAPACITY: usize = 4;

#[derive(Debug, Default)]
struct Endpoints {
    workers: HashMap<String, mpsc::Sender<WorkerInput>>,
    outputs: HashMap<String, mpsc::Sender<OutputMessage>>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDirectory {
    endpoints: Arc<Endpoints>,
}

/// Builds a directory before the nodes start; endpoints are fixed afterwards.
#[derive(Debug, Default)]
pub struct TransportDirectoryBuilder {
    endpoints: Endpoints,
}

impl TransportDirectoryBuilder {
    pub fn worker(mut self, endpoint: impl Into<String>, sender: mpsc::Sender<WorkerInput>) -> Self {
        self.endpoints.workers.insert(endpoint.into(), sender);
        self
    }

    pub fn output(
        mut self,
        endpoint: impl Into<String>,
        sender: mpsc::Sender<OutputMessage>,
    ) -> Self {
        self.endpoints.outputs.insert(endpoint.into(), sender);
        self
    }

    pub fn build(self) -> TransportDirectory {
        TransportDirectory {
            endpoints: Arc::new(self.endpoints),
        }
    }
}

impl TransportDirectory {
    pub fn builder() -> TransportDirectoryBuilder {
        TransportDirectoryBuilder::default()
    }

    /// Opens a sample link from `station` into the worker at `endpoint`.
    pub async fn open_sample_link(
        &self,
        endpoint: &str,
        station: usize,
    ) -> Option<mpsc::Sender<DataChunk>> {
        let inbox = self.endpoints.workers.get(endpoint)?;
        let (tx, chunks) = mpsc::channel(SAMPLE_LINK_CAPACITY);
        inbox
            .send(WorkerInput::Link(SampleLink { station, chunks }))
            .await
            .ok()?;
        Some(tx)
    }

    /// Record link into an output node.
    pub fn connect_output(&self, endpoint: &str) -> Option<mpsc::Sender<OutputMessage>> {
        self.endpoints
            .outputs
            .get(endpoint)
            .filter(|s| !s.is_closed())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_named_endpoints() {
        let (worker_tx, mut worker_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(1);
        let directory = TransportDirectory::builder()
            .worker("worker/0", worker_tx)
            .output("output", out_tx)
            .build();

        let link = directory.open_sample_link("worker/0", 2).await.unwrap();
        match worker_rx.recv().await {
            Some(WorkerInput::Link(SampleLink { station, .. })) => assert_eq!(station, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(link.max_capacity(), SAMPLE_LINK_CAPACITY);
        assert!(directory.open_sample_link("worker/1", 2).await.is_none());
        assert!(directory.connect_output("output").is_some());

        drop(out_rx);
        assert!(directory.connect_output("output").is_none());
        drop(worker_rx);
        assert!(directory.open_sample_link("worker/0", 2).await.is_none());
    }
}
