//! Correlation worker node.
//!
//! Runs one job at a time: the assignment builds a [`CorrelationEngine`],
//! sample chunks from the stations feed it, and the engine is driven until it
//! stalls after every chunk. Finished or failed jobs are reported to the
//! output node and the scheduler, and the worker reports ready again.
//!
//! Each station feeds the worker over its own bounded link. When a stream's
//! queue in the engine is full the rest of the chunk is parked and that link
//! is not read again until the engine has taken the parked samples, so the
//! station waits instead of the worker buffering the whole job.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};

use correlation_core::{CorrelationEngine, CorrelationError, CorrelationParameters, StreamInput};
use delay_model::FftDelayKernel;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::TransportDirectory;
use super::{NodeOutcome, NodeResult};
use crate::config::CorrelationConfig;
use crate::scheduler::messages::{
    ChunkPayload, ConnectionSetup, DataChunk, JobAssignment, LinkRole, OutputMessage,
    SampleLink, SchedulerEvent, WorkerId, WorkerInput, WorkerMessage, WorkerStatus,
    WorkerStatusMessage,
};
use crate::{Error, Result};

struct ActiveJob {
    assignment: JobAssignment,
    engine: CorrelationEngine<FftDelayKernel>,
}

/// Samples the engine refused, waiting for room in their stream's queue.
struct Parked {
    stream: usize,
    samples: Vec<f32>,
}

struct LinkState {
    station: usize,
    chunks: mpsc::Receiver<DataChunk>,
    parked: Option<Parked>,
    closed: bool,
}

/// Next chunk from any open link that has nothing parked.
fn poll_links(links: &mut [LinkState], cx: &mut Context<'_>) -> Poll<(usize, DataChunk)> {
    for (index, link) in links.iter_mut().enumerate() {
        if link.closed || link.parked.is_some() {
            continue;
        }
        match link.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => return Poll::Ready((index, chunk)),
            Poll::Ready(None) => link.closed = true,
            Poll::Pending => {}
        }
    }
    Poll::Pending
}

/// Pushes samples and parks what the stream's queue has no room for.
fn push_or_park(
    engine: &mut CorrelationEngine<FftDelayKernel>,
    link: &mut LinkState,
    stream: usize,
    mut samples: Vec<f32>,
) -> std::result::Result<usize, CorrelationError> {
    let accepted = engine.push_samples(stream, &samples)?;
    if accepted < samples.len() {
        samples.drain(..accepted);
        link.parked = Some(Parked { stream, samples });
    }
    Ok(accepted)
}

/// Runs the engine until it stalls, feeding parked samples as frames free
/// room in their queues.
fn drive(
    engine: &mut CorrelationEngine<FftDelayKernel>,
    links: &mut [LinkState],
) -> std::result::Result<(), CorrelationError> {
    loop {
        engine.run_until_stalled()?;
        let mut fed = 0;
        for link in links.iter_mut() {
            if let Some(Parked { stream, samples }) = link.parked.take() {
                fed += push_or_park(engine, link, stream, samples)?;
            }
        }
        if fed == 0 {
            return Ok(());
        }
    }
}

pub struct WorkerNode {
    worker_id: WorkerId,
    config: Arc<CorrelationConfig>,
    inbox: mpsc::Receiver<WorkerInput>,
    events: mpsc::Sender<SchedulerEvent>,
    transport: TransportDirectory,
    output: Option<mpsc::Sender<OutputMessage>>,
    links: Vec<LinkState>,
    job: Option<ActiveJob>,
    cancellation_token: CancellationToken,
}

impl WorkerNode {
    pub fn new(
        worker_id: WorkerId,
        config: Arc<CorrelationConfig>,
        inbox: mpsc::Receiver<WorkerInput>,
        events: mpsc::Sender<SchedulerEvent>,
        transport: TransportDirectory,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            config,
            inbox,
            events,
            transport,
            output: None,
            links: Vec::new(),
            job: None,
            cancellation_token,
        }
    }

    pub async fn run(mut self) -> NodeResult {
        debug!(worker_id = self.worker_id, "Worker starting");
        self.report_ready(None).await?;

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    debug!(worker_id = self.worker_id, "Worker cancelled");
                    return Ok(NodeOutcome::Cancelled);
                }
                input = self.inbox.recv() => match input {
                    None | Some(WorkerInput::Control(WorkerMessage::Stop)) => break,
                    Some(WorkerInput::Control(WorkerMessage::Connect(setup))) => self.connect(setup).await?,
                    Some(WorkerInput::Control(WorkerMessage::Assign(assignment))) => self.assign(assignment).await?,
                    Some(WorkerInput::Link(link)) => self.attach(link),
                },
                (link, chunk) = poll_fn(|cx| poll_links(&mut self.links, cx)) => {
                    self.consume(link, chunk).await?
                }
            }
        }

        if let Some(job) = self.job.take() {
            warn!(
                worker_id = self.worker_id,
                slice_nr = job.assignment.slice_nr,
                "Worker stopped with a job in progress"
            );
        }
        debug!(worker_id = self.worker_id, "Worker stopped");
        Ok(NodeOutcome::Stopped)
    }

    async fn connect(&mut self, setup: ConnectionSetup) -> Result<()> {
        let event = match (setup.role, self.transport.connect_output(&setup.transport_endpoint)) {
            (LinkRole::Downstream, Some(link)) => {
                self.output = Some(link);
                debug!(worker_id = self.worker_id, endpoint = %setup.transport_endpoint, "Output link up");
                SchedulerEvent::ConnectionEstablished(setup)
            }
            (LinkRole::Downstream, None) => SchedulerEvent::ConnectionFailed {
                reason: format!("no output endpoint {}", setup.transport_endpoint),
                setup,
            },
            (LinkRole::Upstream, _) => SchedulerEvent::ConnectionFailed {
                reason: "upstream links are owned by stations".to_string(),
                setup,
            },
        };
        self.send_event(event).await
    }

    fn attach(&mut self, link: SampleLink) {
        debug!(worker_id = self.worker_id, station = link.station, "Sample link up");
        self.links.push(LinkState {
            station: link.station,
            chunks: link.chunks,
            parked: None,
            closed: false,
        });
    }

    async fn assign(&mut self, assignment: JobAssignment) -> Result<()> {
        if let Some(previous) = self.job.take() {
            error!(
                worker_id = self.worker_id,
                slice_nr = previous.assignment.slice_nr,
                "New assignment while a job is running"
            );
            self.release_parked();
            self.fail(previous.assignment, "superseded by a new assignment".to_string())
                .await?;
        }

        match self.build_engine(&assignment) {
            Ok(engine) => {
                debug!(
                    worker_id = self.worker_id,
                    slice_nr = assignment.slice_nr,
                    channel = assignment.channel_id,
                    streams = assignment.station_stream_list.len(),
                    "Job accepted"
                );
                self.job = Some(ActiveJob { assignment, engine });
                self.report_status(WorkerStatus::Busy, None).await
            }
            Err(e) => self.fail(assignment, e.to_string()).await,
        }
    }

    fn build_engine(
        &self,
        assignment: &JobAssignment,
    ) -> std::result::Result<CorrelationEngine<FftDelayKernel>, CorrelationError> {
        let invalid = |msg: String| CorrelationError::InvalidParameters(msg);
        let scan = self
            .config
            .scans
            .get(assignment.scan_index)
            .ok_or_else(|| invalid(format!("unknown scan {}", assignment.scan_id)))?;
        let channels = &scan.mode.channels;
        let channel = channels
            .get(assignment.channel_id)
            .ok_or_else(|| invalid(format!("unknown channel {}", assignment.channel_id)))?;

        let pulsar = match &assignment.pulsar {
            Some((name, _)) => Some(
                self.config
                    .pulsars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| invalid(format!("unknown pulsar {name}")))?,
            ),
            None => None,
        };
        let extra_delay_s = assignment
            .phase_center
            .as_ref()
            .map_or(0.0, |p| self.config.source_offset(&p.source));

        let inputs = assignment
            .station_stream_list
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let station = self
                    .config
                    .stations
                    .get(spec.station)
                    .ok_or_else(|| invalid(format!("unknown station {}", spec.station)))?;
                let geometry = channels
                    .get(assignment.stream_channel(i))
                    .map(|c| c.geometry)
                    .ok_or_else(|| invalid(format!("no channel for stream {i}")))?;
                Ok(StreamInput {
                    model: station.delay.clone(),
                    kernel: FftDelayKernel::new(
                        self.config.fft_size,
                        geometry.sky_frequency,
                        geometry.upper_sideband,
                    ),
                })
            })
            .collect::<std::result::Result<Vec<_>, CorrelationError>>()?;

        let params = CorrelationParameters {
            slice_nr: assignment.slice_nr,
            start: assignment.time_slice_start,
            fft_size: self.config.fft_size,
            sample_rate: self.config.sample_rate,
            ffts_per_integration: self.config.ffts_per_integration,
            n_integrations: 1,
            streams: assignment.station_stream_list.clone(),
            channel: channel.geometry,
            pulsar,
            extra_delay_s,
            pool_depth: self.config.pool_depth,
            // One chunk of headroom past the pool keeps interleaved streams
            // of a station from waiting on each other.
            queue_limit: self.config.pool_depth * 2 * self.config.fft_size
                + self.config.chunk_size,
        };
        CorrelationEngine::new(params, inputs)
    }

    async fn consume(&mut self, link: usize, chunk: DataChunk) -> Result<()> {
        let Some(job) = self.job.as_mut() else {
            debug!(worker_id = self.worker_id, slice_nr = chunk.slice_nr, "Chunk without a job");
            return Ok(());
        };
        if job.assignment.slice_nr != chunk.slice_nr {
            debug!(
                worker_id = self.worker_id,
                station = self.links[link].station,
                slice_nr = chunk.slice_nr,
                "Chunk of another slice dropped"
            );
            return Ok(());
        }

        let fed = match chunk.payload {
            ChunkPayload::Samples(samples) => {
                push_or_park(&mut job.engine, &mut self.links[link], chunk.stream, samples)
                    .map(|_| ())
            }
            ChunkPayload::End => job.engine.end_of_stream(chunk.stream),
        };
        let progress = fed.and_then(|_| drive(&mut job.engine, &mut self.links));
        let finished = job.engine.finished();

        match progress {
            Err(e) => {
                if let Some(job) = self.job.take() {
                    self.release_parked();
                    self.fail(job.assignment, e.to_string()).await?;
                }
            }
            Ok(_) if finished => {
                if let Some(job) = self.job.take() {
                    self.release_parked();
                    self.complete(job).await?;
                }
            }
            Ok(_) => {}
        }
        Ok(())
    }

    /// Drops samples still parked for a job that has ended.
    fn release_parked(&mut self) {
        for link in &mut self.links {
            link.parked = None;
        }
    }

    async fn complete(&mut self, mut job: ActiveJob) -> Result<()> {
        let slice_nr = job.assignment.slice_nr;
        let phase_center = job.assignment.phase_center.as_ref().map(|p| p.index);
        let records = job.engine.take_records();
        let (samples, spectra) = job.engine.pool_stats();
        debug!(
            worker_id = self.worker_id,
            slice_nr,
            sample_allocations = samples.allocations,
            sample_reuses = samples.reuses,
            spectrum_allocations = spectra.allocations,
            spectrum_reuses = spectra.reuses,
            "Buffer pool usage"
        );

        for record in records {
            self.send_output(OutputMessage::Record {
                phase_center,
                record,
            })
            .await?;
        }
        self.send_output(OutputMessage::SliceComplete { slice_nr })
            .await?;
        info!(worker_id = self.worker_id, slice_nr, "Slice correlated");
        self.report_ready(Some(slice_nr)).await
    }

    async fn fail(&mut self, assignment: JobAssignment, reason: String) -> Result<()> {
        let slice_nr = assignment.slice_nr;
        warn!(worker_id = self.worker_id, slice_nr, "Job failed: {}", reason);
        self.send_output(OutputMessage::SliceFailed {
            slice_nr,
            reason: reason.clone(),
        })
        .await?;
        self.send_event(SchedulerEvent::JobFailed {
            worker_id: self.worker_id,
            slice_nr,
            reason,
        })
        .await?;
        self.report_ready(None).await
    }

    async fn report_ready(&self, last_completed_slice_nr: Option<u64>) -> Result<()> {
        self.report_status(WorkerStatus::Ready, last_completed_slice_nr)
            .await
    }

    async fn report_status(
        &self,
        status: WorkerStatus,
        last_completed_slice_nr: Option<u64>,
    ) -> Result<()> {
        self.send_event(SchedulerEvent::Status(WorkerStatusMessage {
            worker_id: self.worker_id,
            status,
            last_completed_slice_nr,
        }))
        .await
    }

    async fn send_event(&self, event: SchedulerEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::node_stopped("scheduler"))
    }

    async fn send_output(&self, msg: OutputMessage) -> Result<()> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| Error::connection(self.worker_id, "output link not established"))?;
        output
            .send(msg)
            .await
            .map_err(|_| Error::node_stopped("output"))
    }
}
