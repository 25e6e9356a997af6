//! The manager scheduler: connection barrier, then a state machine over scans
//! and time slices that hands jobs to ready workers.
//!
//! All scheduling state lives in this task. It suspends only while waiting
//! for a scheduler event (readiness, completion, connection acknowledgement or
//! the output drain) or the connection deadline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use delay_model::Time;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::barrier::ConnectionBarrier;
use super::context::{ScanStart, SchedulerContext, SliceAdvance};
use super::expander::{Job, JobExpander};
use super::handle::NodeHandle;
use super::messages::{
    ConnectionSetup, DeliveryRequest, LinkRole, NodeId, OutputMessage, SchedulerEvent,
    StationMessage, StreamRequest, WorkerId, WorkerInput, WorkerMessage, WorkerStatus,
};
use super::registry::ReadinessRegistry;
use crate::config::CorrelationConfig;
use crate::{Error, Result};

/// Endpoint name of the output node's record link.
pub const OUTPUT_ENDPOINT: &str = "output";

/// Endpoint name of a worker's sample link.
pub fn worker_endpoint(worker_id: WorkerId) -> String {
    format!("worker/{worker_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    StartNewScan,
    StartTimeSlice,
    AssignJobs,
    NextTimeSlice,
    Stop,
    DrainOutput,
    Done,
}

/// One assignment as recorded in the run report.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentSummary {
    pub slice_nr: u64,
    pub worker_id: WorkerId,
    pub scan: String,
    pub start: Time,
    pub channel: usize,
    pub cross_channel: Option<usize>,
    pub bins: Option<usize>,
    pub phase_center: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub assignments: Vec<AssignmentSummary>,
    pub failed_slices: Vec<u64>,
    pub slices_written: u64,
    pub slices_missing: u64,
    pub disabled_workers: Vec<WorkerId>,
    pub terminated: bool,
}

impl RunReport {
    /// Assignments per worker.
    pub fn jobs_per_worker(&self) -> BTreeMap<WorkerId, usize> {
        let mut counts = BTreeMap::new();
        for a in &self.assignments {
            *counts.entry(a.worker_id).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "slices assigned: {}", self.assignments.len())?;
        writeln!(f, "slices written:  {}", self.slices_written)?;
        writeln!(f, "slices missing:  {}", self.slices_missing)?;
        for (worker, jobs) in self.jobs_per_worker() {
            writeln!(f, "  worker {worker}: {jobs} jobs")?;
        }
        if !self.failed_slices.is_empty() {
            writeln!(f, "failed slices: {:?}", self.failed_slices)?;
        }
        if !self.disabled_workers.is_empty() {
            writeln!(f, "excluded workers: {:?}", self.disabled_workers)?;
        }
        if self.terminated {
            writeln!(f, "run was terminated early")?;
        }
        Ok(())
    }
}

/// Handles to every node plus the scheduler's event inbox.
pub struct SchedulerLinks {
    pub workers: Vec<NodeHandle<WorkerInput>>,
    pub stations: Vec<NodeHandle<StationMessage>>,
    pub output: NodeHandle<OutputMessage>,
    pub events: mpsc::Receiver<SchedulerEvent>,
}

pub struct ManagerScheduler {
    config: Arc<CorrelationConfig>,
    expander: JobExpander,
    context: SchedulerContext,
    registry: ReadinessRegistry,
    links: SchedulerLinks,
    cancellation_token: CancellationToken,
    state: SchedulerState,
    report: RunReport,
    drained: bool,
}

impl ManagerScheduler {
    pub fn new(
        config: Arc<CorrelationConfig>,
        links: SchedulerLinks,
        cancellation_token: CancellationToken,
    ) -> Self {
        let registry = ReadinessRegistry::new(links.workers.len(), config.scheduling);
        Self {
            expander: JobExpander::new(config.clone()),
            context: SchedulerContext::new(&config),
            config,
            registry,
            links,
            cancellation_token,
            state: SchedulerState::StartNewScan,
            report: RunReport::default(),
            drained: false,
        }
    }

    /// Token that moves the scheduler straight to `Stop`.
    pub fn terminate_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Runs the whole correlation and returns the report.
    pub async fn run(mut self) -> Result<RunReport> {
        info!(
            experiment = %self.config.experiment,
            workers = self.links.workers.len(),
            stations = self.links.stations.len(),
            scans = self.config.scans.len(),
            "Starting correlation"
        );

        self.connect().await?;

        while self.state != SchedulerState::Done {
            if self.cancellation_token.is_cancelled()
                && matches!(
                    self.state,
                    SchedulerState::StartNewScan
                        | SchedulerState::StartTimeSlice
                        | SchedulerState::AssignJobs
                        | SchedulerState::NextTimeSlice
                )
            {
                info!("Terminate requested, stopping assignment");
                self.report.terminated = true;
                self.state = SchedulerState::Stop;
            }
            debug!(state = ?self.state, "Scheduler step");
            self.state = match self.state {
                SchedulerState::StartNewScan => self.start_new_scan(),
                SchedulerState::StartTimeSlice => {
                    self.context.start_slice();
                    SchedulerState::AssignJobs
                }
                SchedulerState::AssignJobs => self.assign_jobs().await?,
                SchedulerState::NextTimeSlice => match self.context.advance_slice() {
                    SliceAdvance::SameScan => SchedulerState::StartTimeSlice,
                    SliceAdvance::NextScan => SchedulerState::StartNewScan,
                    SliceAdvance::Stop => SchedulerState::Stop,
                },
                SchedulerState::Stop => self.stop().await?,
                SchedulerState::DrainOutput => self.drain_output().await?,
                SchedulerState::Done => SchedulerState::Done,
            };
        }

        self.shutdown_nodes().await;
        self.report.disabled_workers = self.registry.disabled_workers();
        info!(
            assigned = self.report.assignments.len(),
            written = self.report.slices_written,
            missing = self.report.slices_missing,
            "Correlation finished"
        );
        Ok(self.report)
    }

    /// Brings up every worker link and waits for all acknowledgements.
    async fn connect(&mut self) -> Result<()> {
        let mut barrier = ConnectionBarrier::new(self.config.connection_timeout);
        let mut station_setups = Vec::new();
        let mut worker_setups = Vec::new();
        for worker in &self.links.workers {
            let NodeId::Worker(worker_id) = worker.id else {
                return Err(Error::invariant(format!("{} is not a worker", worker.id)));
            };
            for station in &self.links.stations {
                let setup = ConnectionSetup {
                    worker_id,
                    peer_id: station.id,
                    role: LinkRole::Upstream,
                    transport_endpoint: worker_endpoint(worker_id),
                };
                barrier.expect(setup.key());
                station_setups.push(setup);
            }
            let setup = ConnectionSetup {
                worker_id,
                peer_id: NodeId::Output,
                role: LinkRole::Downstream,
                transport_endpoint: OUTPUT_ENDPOINT.to_string(),
            };
            barrier.expect(setup.key());
            worker_setups.push(setup);
        }
        let deadline = barrier.deadline();
        self.registry.begin_connections(barrier);

        for setup in station_setups {
            let NodeId::Station(station) = setup.peer_id else {
                continue;
            };
            let handle = &self.links.stations[station];
            handle
                .send(StationMessage::Connect(setup))
                .await
                .map_err(|e| Error::node_stopped(format!("{}: {e}", handle.id)))?;
        }
        for setup in worker_setups {
            let handle = &self.links.workers[setup.worker_id];
            handle
                .send(WorkerInput::Control(WorkerMessage::Connect(setup)))
                .await
                .map_err(|e| Error::node_stopped(format!("{}: {e}", handle.id)))?;
        }

        while !self.registry.connections_complete() {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    info!("Terminate requested during connection setup");
                    self.report.terminated = true;
                    self.state = SchedulerState::Stop;
                    return Ok(());
                }
                event = self.links.events.recv() => {
                    let event = event.ok_or_else(|| Error::node_stopped("scheduler event channel"))?;
                    self.handle_event(event);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let pending = self
                        .registry
                        .barrier_mut()
                        .map(|b| b.pending_workers())
                        .unwrap_or_default();
                    for worker_id in pending {
                        let err = Error::connection(worker_id, "connection setup timed out");
                        warn!("{}", err);
                        self.registry.disable(worker_id);
                    }
                }
            }
        }

        if self.registry.active_workers() == 0 {
            error!("No worker completed connection setup");
            return Err(Error::NoWorkers);
        }
        info!(
            workers = self.registry.active_workers(),
            "All connections established"
        );
        Ok(())
    }

    fn start_new_scan(&mut self) -> SchedulerState {
        let scan_index = self.context.scan_index;
        match self.context.start_scan(&self.config.scans) {
            ScanStart::Started { slices } => {
                let scan = &self.config.scans[scan_index];
                info!(
                    scan = %scan.name,
                    start = %self.context.clock(),
                    stop = %self.context.scan_stop(),
                    slices,
                    "Starting scan"
                );
                SchedulerState::StartTimeSlice
            }
            ScanStart::Skipped => {
                warn!(
                    scan = %self.config.scans[scan_index].name,
                    "Scan is shorter than one integration, skipping"
                );
                SchedulerState::StartNewScan
            }
            ScanStart::Exhausted => {
                debug!(scan_index, "No scan left before the stop time");
                SchedulerState::Stop
            }
        }
    }

    async fn assign_jobs(&mut self) -> Result<SchedulerState> {
        let slice = self.context.current_slice();
        let channels = self.expander.channel_count(&slice);
        loop {
            if self.cancellation_token.is_cancelled() {
                return Ok(SchedulerState::StartTimeSlice);
            }
            while self.context.pending.is_empty() && self.context.cursor < channels {
                let jobs = self.expander.expand(&slice, self.context.cursor);
                self.context.pending.extend(jobs);
                self.context.cursor += 1;
            }
            if self.context.pending.is_empty() {
                return Ok(SchedulerState::NextTimeSlice);
            }

            match self.registry.next_ready() {
                Some(worker_id) => {
                    if let Some(job) = self.context.pending.pop_front() {
                        self.assign(worker_id, job).await?;
                    }
                }
                None => {
                    if self.registry.active_workers() == 0 {
                        return Err(Error::NoWorkers);
                    }
                    if !self.wait_event().await? {
                        return Ok(SchedulerState::StartTimeSlice);
                    }
                }
            }
        }
    }

    async fn assign(&mut self, worker_id: WorkerId, job: Job) -> Result<()> {
        let slice_nr = self.context.take_slice_nr();
        if !self.registry.assign(worker_id, slice_nr) {
            return Err(Error::invariant(format!(
                "slice {slice_nr} assigned to worker {worker_id} which is not ready"
            )));
        }
        let assignment = job.assignment(slice_nr);

        let worker = &self.links.workers[worker_id];
        worker
            .send(WorkerInput::Control(WorkerMessage::Assign(assignment.clone())))
            .await
            .map_err(|e| Error::node_stopped(format!("{}: {e}", worker.id)))?;

        let mut per_station: BTreeMap<usize, Vec<StreamRequest>> = BTreeMap::new();
        for (stream, spec) in assignment.station_stream_list.iter().enumerate() {
            per_station.entry(spec.station).or_default().push(StreamRequest {
                stream,
                channel: assignment.stream_channel(stream),
            });
        }
        for (station, streams) in per_station {
            let handle = self.links.stations.get(station).ok_or_else(|| {
                Error::invariant(format!("job {slice_nr} names unknown station {station}"))
            })?;
            let request = DeliveryRequest {
                slice_nr,
                worker_id,
                scan_index: assignment.scan_index,
                start: assignment.time_slice_start,
                stop: assignment.time_slice_stop,
                streams,
            };
            handle
                .send(StationMessage::Deliver(request))
                .await
                .map_err(|e| Error::node_stopped(format!("{}: {e}", handle.id)))?;
        }

        info!(
            slice_nr,
            worker_id,
            "start {}, channel {} to correlation node {}",
            assignment.time_slice_start,
            assignment.channel_id,
            worker_id
        );
        self.report.assignments.push(AssignmentSummary {
            slice_nr,
            worker_id,
            scan: assignment.scan_id,
            start: assignment.time_slice_start,
            channel: assignment.channel_id,
            cross_channel: assignment.cross_channel_id,
            bins: assignment.pulsar.map(|(_, bins)| bins),
            phase_center: assignment.phase_center.map(|p| p.source),
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<SchedulerState> {
        let total_slices = self.context.slices_assigned();
        info!(total_slices, "All jobs assigned, waiting for output");
        let output = &self.links.output;
        output
            .send(OutputMessage::Finish { total_slices })
            .await
            .map_err(|e| Error::node_stopped(format!("{}: {e}", output.id)))?;
        Ok(SchedulerState::DrainOutput)
    }

    /// Waits for the output node's acknowledgement. Terminate does not skip
    /// this.
    async fn drain_output(&mut self) -> Result<SchedulerState> {
        while !self.drained {
            let event = self
                .links
                .events
                .recv()
                .await
                .ok_or_else(|| Error::node_stopped("scheduler event channel"))?;
            self.handle_event(event);
        }
        Ok(SchedulerState::Done)
    }

    /// Waits for one event. Returns false when terminate was requested.
    async fn wait_event(&mut self) -> Result<bool> {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => Ok(false),
            event = self.links.events.recv() => {
                let event = event.ok_or_else(|| Error::node_stopped("scheduler event channel"))?;
                self.handle_event(event);
                Ok(true)
            }
        }
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Status(status) => match status.status {
                WorkerStatus::Ready => {
                    if self.registry.mark_ready(status.worker_id) {
                        debug!(
                            worker_id = status.worker_id,
                            last_completed = ?status.last_completed_slice_nr,
                            "Worker ready"
                        );
                    }
                }
                WorkerStatus::Busy => {
                    debug!(worker_id = status.worker_id, "Worker busy");
                }
            },
            SchedulerEvent::JobFailed {
                worker_id,
                slice_nr,
                reason,
            } => {
                warn!(worker_id, slice_nr, "Job failed, slice will be missing: {}", reason);
                self.report.failed_slices.push(slice_nr);
            }
            SchedulerEvent::ConnectionEstablished(setup) => {
                if let Some(barrier) = self.registry.barrier_mut()
                    && barrier.acknowledge(&setup.key())
                {
                    debug!(
                        worker_id = setup.worker_id,
                        peer = %setup.peer_id,
                        remaining = barrier.remaining(),
                        "Link established"
                    );
                }
            }
            SchedulerEvent::ConnectionFailed { setup, reason } => {
                let err = Error::connection(setup.worker_id, reason);
                warn!(peer = %setup.peer_id, "{}", err);
                self.registry.disable(setup.worker_id);
            }
            SchedulerEvent::OutputDrained {
                slices_written,
                slices_missing,
            } => {
                self.report.slices_written = slices_written;
                self.report.slices_missing = slices_missing;
                self.drained = true;
            }
        }
    }

    async fn shutdown_nodes(&self) {
        for worker in &self.links.workers {
            if worker
                .send(WorkerInput::Control(WorkerMessage::Stop))
                .await
                .is_err()
            {
                debug!(node = %worker.id, "Node already stopped");
            }
        }
        for station in &self.links.stations {
            if station.send(StationMessage::Stop).await.is_err() {
                debug!(node = %station.id, "Node already stopped");
            }
        }
        if self.links.output.send(OutputMessage::Stop).await.is_err() {
            debug!("Output node already stopped");
        }
    }
}
