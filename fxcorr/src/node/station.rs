//! Station input node.
//!
//! A station owns the upstream links to the workers. For every delivery
//! request it reads the job's samples from its [`SampleSource`] and sends them
//! to the worker in fixed-size chunks, taking one chunk of each stream in
//! turn and closing a stream with an end marker right after its last chunk.

use std::collections::HashMap;
use std::sync::Arc;

use delay_model::{MICROS_PER_SECOND, Time};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::transport::TransportDirectory;
use super::{NodeOutcome, NodeResult};
use crate::config::{CorrelationConfig, Station};
use crate::scheduler::messages::{
    ChunkPayload, ConnectionSetup, DataChunk, DeliveryRequest, LinkRole, SchedulerEvent,
    StationMessage, WorkerId,
};
use crate::{Error, Result};

/// Samples of one stream of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRequest {
    pub scan_index: usize,
    /// Channel index in the scan's mode.
    pub channel: usize,
    pub start: Time,
    pub n_samples: usize,
    pub sample_rate: f64,
}

/// Reader of recorded station data.
pub trait SampleSource: Send {
    /// Returns at most `request.n_samples` samples; fewer when the recording
    /// ends inside the window.
    fn read(&mut self, request: &SampleRequest) -> Vec<f32>;
}

/// Deterministic stand-in for a recording: a sky signal shared by every
/// station plus noise of this station.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    seed: u64,
    data_end: Option<Time>,
    noise_level: f32,
}

impl SyntheticSource {
    pub fn new(seed: u64, data_end: Option<Time>) -> Self {
        Self {
            seed,
            data_end,
            noise_level: 0.5,
        }
    }

    pub fn for_station(station: &Station) -> Self {
        Self::new(station.seed, station.data_end)
    }

    fn available(&self, request: &SampleRequest) -> usize {
        match self.data_end {
            None => request.n_samples,
            Some(end) => {
                let micros = (end - request.start).max(0) as f64;
                let samples = (micros * request.sample_rate / MICROS_PER_SECOND as f64).floor();
                (samples as usize).min(request.n_samples)
            }
        }
    }
}

impl SampleSource for SyntheticSource {
    fn read(&mut self, request: &SampleRequest) -> Vec<f32> {
        let n = self.available(request);
        let sky_seed = (request.start.as_micros() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ request.channel as u64;
        let mut sky = StdRng::seed_from_u64(sky_seed);
        let mut noise = StdRng::seed_from_u64(sky_seed ^ self.seed.wrapping_mul(0xBF58_476D_1CE4_E5B9));
        (0..n)
            .map(|_| {
                sky.random_range(-1.0f32..1.0)
                    + self.noise_level * noise.random_range(-1.0f32..1.0)
            })
            .collect()
    }
}

pub struct StationNode<S: SampleSource = SyntheticSource> {
    station: usize,
    config: Arc<CorrelationConfig>,
    source: S,
    inbox: mpsc::Receiver<StationMessage>,
    events: mpsc::Sender<SchedulerEvent>,
    transport: TransportDirectory,
    links: HashMap<WorkerId, mpsc::Sender<DataChunk>>,
    cancellation_token: CancellationToken,
}

impl<S: SampleSource> StationNode<S> {
    pub fn new(
        station: usize,
        config: Arc<CorrelationConfig>,
        source: S,
        inbox: mpsc::Receiver<StationMessage>,
        events: mpsc::Sender<SchedulerEvent>,
        transport: TransportDirectory,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            station,
            config,
            source,
            inbox,
            events,
            transport,
            links: HashMap::new(),
            cancellation_token,
        }
    }

    pub async fn run(mut self) -> NodeResult {
        debug!(station = self.station, "Station starting");
        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    debug!(station = self.station, "Station cancelled");
                    return Ok(NodeOutcome::Cancelled);
                }
                msg = self.inbox.recv() => match msg {
                    None | Some(StationMessage::Stop) => break,
                    Some(StationMessage::Connect(setup)) => self.connect(setup).await?,
                    Some(StationMessage::Deliver(request)) => self.deliver(request).await?,
                }
            }
        }
        debug!(station = self.station, "Station stopped");
        Ok(NodeOutcome::Stopped)
    }

    async fn connect(&mut self, setup: ConnectionSetup) -> Result<()> {
        let link = match setup.role {
            LinkRole::Upstream => {
                self.transport
                    .open_sample_link(&setup.transport_endpoint, self.station)
                    .await
            }
            LinkRole::Downstream => None,
        };
        let event = match link {
            Some(link) => {
                self.links.insert(setup.worker_id, link);
                debug!(
                    station = self.station,
                    worker_id = setup.worker_id,
                    "Upstream link up"
                );
                SchedulerEvent::ConnectionEstablished(setup)
            }
            None => SchedulerEvent::ConnectionFailed {
                reason: format!("no worker endpoint {}", setup.transport_endpoint),
                setup,
            },
        };
        self.events
            .send(event)
            .await
            .map_err(|_| Error::node_stopped("scheduler"))
    }

    async fn deliver(&mut self, request: DeliveryRequest) -> Result<()> {
        let link = self
            .links
            .get(&request.worker_id)
            .cloned()
            .ok_or_else(|| Error::connection(request.worker_id, format!("station {} has no link", self.station)))?;
        let n_samples = self.config.samples_per_slice();
        let chunk_size = self.config.chunk_size;

        let mut samples = Vec::with_capacity(request.streams.len());
        for stream in &request.streams {
            let data = self.source.read(&SampleRequest {
                scan_index: request.scan_index,
                channel: stream.channel,
                start: request.start,
                n_samples,
                sample_rate: self.config.sample_rate,
            });
            if data.len() < n_samples {
                debug!(
                    station = self.station,
                    slice_nr = request.slice_nr,
                    stream = stream.stream,
                    available = data.len(),
                    needed = n_samples,
                    "Recording ends inside the slice"
                );
            }
            samples.push((stream.stream, data));
        }

        let mut open: Vec<_> = samples
            .iter()
            .map(|(stream, data)| (*stream, data.chunks(chunk_size)))
            .collect();
        while !open.is_empty() {
            for (stream, chunks) in &mut open {
                if let Some(chunk) = chunks.next() {
                    let data = DataChunk {
                        slice_nr: request.slice_nr,
                        stream: *stream,
                        payload: ChunkPayload::Samples(chunk.to_vec()),
                    };
                    send_chunk(&link, request.worker_id, data).await?;
                }
                if chunks.len() == 0 {
                    let end = DataChunk {
                        slice_nr: request.slice_nr,
                        stream: *stream,
                        payload: ChunkPayload::End,
                    };
                    send_chunk(&link, request.worker_id, end).await?;
                }
            }
            open.retain(|(_, chunks)| chunks.len() > 0);
        }
        trace!(
            station = self.station,
            slice_nr = request.slice_nr,
            worker_id = request.worker_id,
            "Delivery complete"
        );
        Ok(())
    }
}

async fn send_chunk(
    link: &mpsc::Sender<DataChunk>,
    worker_id: WorkerId,
    chunk: DataChunk,
) -> Result<()> {
    link.send(chunk)
        .await
        .map_err(|_| Error::node_stopped(format!("worker-{worker_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_utils::{basic_control, config_from};
    use crate::scheduler::messages::{NodeId, SampleLink, StreamRequest, WorkerInput};

    fn request(start: Time, n_samples: usize) -> SampleRequest {
        SampleRequest {
            scan_index: 0,
            channel: 0,
            start,
            n_samples,
            sample_rate: 1000.0,
        }
    }

    #[test]
    fn test_synthetic_source_is_deterministic() {
        let t = Time::from_micros(1_000_000);
        let a = SyntheticSource::new(1, None).read(&request(t, 64));
        let b = SyntheticSource::new(1, None).read(&request(t, 64));
        let c = SyntheticSource::new(2, None).read(&request(t, 64));

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|s| s.abs() <= 1.5));
    }

    #[test]
    fn test_synthetic_source_stops_at_data_end() {
        let t = Time::from_micros(1_000_000);
        // 20 ms of data at 1 kHz
        let mut source = SyntheticSource::new(1, Some(t + 20_000));
        assert_eq!(source.read(&request(t, 64)).len(), 20);
        assert!(source.read(&request(t + 30_000, 64)).is_empty());
    }

    #[tokio::test]
    async fn test_interleaves_streams_and_ends_each_after_its_last_chunk() {
        let config = Arc::new(config_from(basic_control()));
        let (worker_tx, mut worker_rx) = mpsc::channel(64);
        let (inbox_tx, inbox_rx) = mpsc::channel(8);
        let (events_tx, mut events) = mpsc::channel(8);
        let transport = TransportDirectory::builder().worker("worker/0", worker_tx).build();
        let source = SyntheticSource::for_station(&config.stations[0]);
        let node = StationNode::new(
            0,
            config.clone(),
            source,
            inbox_rx,
            events_tx,
            transport,
            CancellationToken::new(),
        );
        let task = tokio::spawn(node.run());

        inbox_tx
            .send(StationMessage::Connect(ConnectionSetup {
                worker_id: 0,
                peer_id: NodeId::Station(0),
                role: LinkRole::Upstream,
                transport_endpoint: "worker/0".into(),
            }))
            .await
            .unwrap();
        let mut link = match worker_rx.recv().await {
            Some(WorkerInput::Link(SampleLink { station: 0, chunks })) => chunks,
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(
            events.recv().await,
            Some(SchedulerEvent::ConnectionEstablished(_))
        ));

        inbox_tx
            .send(StationMessage::Deliver(DeliveryRequest {
                slice_nr: 3,
                worker_id: 0,
                scan_index: 0,
                start: config.start,
                stop: config.start + config.integration_time_us,
                streams: vec![
                    StreamRequest { stream: 2, channel: 1 },
                    StreamRequest { stream: 0, channel: 0 },
                ],
            }))
            .await
            .unwrap();

        // 1024 samples per stream in chunks of 256
        let mut order = Vec::new();
        let mut received = [0usize; 3];
        while order.iter().filter(|(_, end)| *end).count() < 2 {
            let chunk = link.recv().await.unwrap();
            assert_eq!(chunk.slice_nr, 3);
            match chunk.payload {
                ChunkPayload::Samples(s) => {
                    assert!(s.len() <= config.chunk_size);
                    received[chunk.stream] += s.len();
                    order.push((chunk.stream, false));
                }
                ChunkPayload::End => order.push((chunk.stream, true)),
            }
        }
        assert_eq!(
            order,
            vec![
                (2, false),
                (0, false),
                (2, false),
                (0, false),
                (2, false),
                (0, false),
                (2, false),
                (2, true),
                (0, false),
                (0, true),
            ]
        );
        assert_eq!(received[2], config.samples_per_slice());
        assert_eq!(received[0], config.samples_per_slice());

        inbox_tx.send(StationMessage::Stop).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), NodeOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_worker_endpoint_fails_connection() {
        let config = Arc::new(config_from(basic_control()));
        let (inbox_tx, inbox_rx) = mpsc::channel(8);
        let (events_tx, mut events) = mpsc::channel(8);
        let node = StationNode::new(
            1,
            config,
            SyntheticSource::new(0, None),
            inbox_rx,
            events_tx,
            TransportDirectory::default(),
            CancellationToken::new(),
        );
        tokio::spawn(node.run());

        inbox_tx
            .send(StationMessage::Connect(ConnectionSetup {
                worker_id: 4,
                peer_id: NodeId::Station(1),
                role: LinkRole::Upstream,
                transport_endpoint: "worker/4".into(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await,
            Some(SchedulerEvent::ConnectionFailed { .. })
        ));
    }
}
