//! Wires the scheduler, the station and worker nodes and the output node
//! together for one in-process run.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CorrelationConfig, Station};
use crate::node::{
    NodeResult, OutputNode, SampleSource, StationNode, SyntheticSource, TransportDirectory,
    WorkerNode,
};
use crate::scheduler::handle::{DEFAULT_INBOX_CAPACITY, NodeHandle};
use crate::scheduler::messages::NodeId;
use crate::scheduler::{
    ManagerScheduler, OUTPUT_ENDPOINT, RunReport, SchedulerLinks, worker_endpoint,
};
use crate::{Error, Result};

pub struct Correlator {
    config: Arc<CorrelationConfig>,
    cancellation_token: CancellationToken,
}

impl Correlator {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Token whose cancellation terminates the run: assignment stops, jobs in
    /// flight still finish and the output is drained.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn terminate(&self) {
        self.cancellation_token.cancel();
    }

    /// Runs with synthetic station data.
    pub async fn run(&self) -> Result<RunReport> {
        self.run_with_sources(|_, station| SyntheticSource::for_station(station))
            .await
    }

    /// Runs with one sample source per station, built by `make_source`.
    pub async fn run_with_sources<S, F>(&self, make_source: F) -> Result<RunReport>
    where
        S: SampleSource + 'static,
        F: Fn(usize, &Station) -> S,
    {
        let config = self.config.clone();
        let node_token = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
        let mut transport = TransportDirectory::builder();

        let mut worker_inboxes = Vec::with_capacity(config.workers);
        let mut worker_handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let (tx, rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
            transport = transport.worker(worker_endpoint(worker_id), tx.clone());
            worker_handles.push(NodeHandle::new(
                NodeId::Worker(worker_id),
                tx,
                node_token.child_token(),
            ));
            worker_inboxes.push(rx);
        }

        let (output_tx, output_rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
        transport = transport.output(OUTPUT_ENDPOINT, output_tx.clone());
        let output_handle = NodeHandle::new(NodeId::Output, output_tx, node_token.child_token());
        let transport = transport.build();

        let mut nodes: JoinSet<NodeResult> = JoinSet::new();
        let output = OutputNode::create(
            config.clone(),
            output_rx,
            events_tx.clone(),
            output_handle.cancellation_token(),
        )?;
        nodes.spawn(output.run());

        for (worker_id, inbox) in worker_inboxes.into_iter().enumerate() {
            let worker = WorkerNode::new(
                worker_id,
                config.clone(),
                inbox,
                events_tx.clone(),
                transport.clone(),
                worker_handles[worker_id].cancellation_token(),
            );
            nodes.spawn(worker.run());
        }

        let mut station_handles = Vec::with_capacity(config.stations.len());
        for (index, station) in config.stations.iter().enumerate() {
            let (tx, rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
            let handle = NodeHandle::new(NodeId::Station(index), tx, node_token.child_token());
            let node = StationNode::new(
                index,
                config.clone(),
                make_source(index, station),
                rx,
                events_tx.clone(),
                transport.clone(),
                handle.cancellation_token(),
            );
            nodes.spawn(node.run());
            station_handles.push(handle);
        }
        drop(events_tx);

        info!(
            workers = config.workers,
            stations = config.stations.len(),
            output = %config.output_file.display(),
            "Nodes started"
        );

        let scheduler = ManagerScheduler::new(
            config.clone(),
            SchedulerLinks {
                workers: worker_handles,
                stations: station_handles,
                output: output_handle,
                events: events_rx,
            },
            self.cancellation_token.clone(),
        );
        let scheduler_run = scheduler.run();
        tokio::pin!(scheduler_run);

        let result = loop {
            tokio::select! {
                result = &mut scheduler_run => break result,
                Some(joined) = nodes.join_next() => match joined {
                    Ok(Ok(outcome)) => debug!(?outcome, "Node finished before the scheduler"),
                    Ok(Err(e)) if !e.is_fatal() => {
                        warn!("Node stopped on a job error, run continues: {}", e);
                    }
                    Ok(Err(e)) => {
                        error!("Node failed: {}", e);
                        break Err(e);
                    }
                    Err(e) => break Err(Error::Other(format!("node task failed: {e}"))),
                },
            }
        };

        match result {
            Ok(report) => {
                while let Some(joined) = nodes.join_next().await {
                    match joined {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("Node failed during shutdown: {}", e),
                        Err(e) => warn!("Node task failed during shutdown: {}", e),
                    }
                }
                Ok(report)
            }
            Err(e) => {
                node_token.cancel();
                nodes.shutdown().await;
                Err(e)
            }
        }
    }
}
