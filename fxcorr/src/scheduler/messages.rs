//! Messages exchanged between the scheduler and the nodes.

use std::fmt;

use correlation_core::{OutputRecord, StreamSpec};
use delay_model::Time;
use tokio::sync::mpsc;

pub type WorkerId = usize;

/// Address of a node in the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    Station(usize),
    Worker(WorkerId),
    Output,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Station(i) => write!(f, "station-{i}"),
            NodeId::Worker(i) => write!(f, "worker-{i}"),
            NodeId::Output => write!(f, "output"),
        }
    }
}

/// Direction of a link, seen from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkRole {
    /// Station to worker sample stream.
    Upstream,
    /// Worker to output record stream.
    Downstream,
}

/// Request to bring up one worker link; acknowledged once the link is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSetup {
    pub worker_id: WorkerId,
    pub peer_id: NodeId,
    pub role: LinkRole,
    /// Endpoint the link owner connects to.
    pub transport_endpoint: String,
}

/// Identity of a link in the connection barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    pub worker_id: WorkerId,
    pub peer_id: NodeId,
    pub role: LinkRole,
}

impl ConnectionSetup {
    pub fn key(&self) -> LinkKey {
        LinkKey {
            worker_id: self.worker_id,
            peer_id: self.peer_id,
            role: self.role,
        }
    }
}

/// Phase center a job is correlated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseCenter {
    /// Index in the run's sorted source list; selects the output file.
    pub index: usize,
    pub source: String,
}

/// A job as sent to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobAssignment {
    pub slice_nr: u64,
    pub scan_index: usize,
    pub scan_id: String,
    pub time_slice_start: Time,
    pub time_slice_stop: Time,
    pub channel_id: usize,
    pub cross_channel_id: Option<usize>,
    pub station_stream_list: Vec<StreamSpec>,
    /// Pulsar name and output bin count (on-pulse bins plus one).
    pub pulsar: Option<(String, usize)>,
    pub phase_center: Option<PhaseCenter>,
}

impl JobAssignment {
    pub fn pulsar_bins(&self) -> Option<usize> {
        self.pulsar.as_ref().map(|(_, bins)| *bins)
    }

    /// Channel carrying `stream`; the second half of a cross-polarised
    /// stream list belongs to the partner channel.
    pub fn stream_channel(&self, stream: usize) -> usize {
        match self.cross_channel_id {
            Some(cross) if stream >= self.station_stream_list.len() / 2 => cross,
            _ => self.channel_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Busy,
}

/// Readiness/completion report from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatusMessage {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub last_completed_slice_nr: Option<u64>,
}

/// One stream a station must send for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    /// Index in the job's stream list.
    pub stream: usize,
    /// Channel of the scan's mode holding this stream's polarisation.
    pub channel: usize,
}

/// Request for a station to send its part of a job to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub slice_nr: u64,
    pub worker_id: WorkerId,
    pub scan_index: usize,
    pub start: Time,
    pub stop: Time,
    pub streams: Vec<StreamRequest>,
}

/// Events consumed by the scheduler loop.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Status(WorkerStatusMessage),
    JobFailed {
        worker_id: WorkerId,
        slice_nr: u64,
        reason: String,
    },
    ConnectionEstablished(ConnectionSetup),
    ConnectionFailed {
        setup: ConnectionSetup,
        reason: String,
    },
    OutputDrained {
        slices_written: u64,
        slices_missing: u64,
    },
}

#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Connect(ConnectionSetup),
    Assign(JobAssignment),
    Stop,
}

#[derive(Debug, Clone)]
pub enum ChunkPayload {
    Samples(Vec<f32>),
    /// The station has nothing more for this stream of this slice.
    End,
}

/// Bulk samples from a station for one stream of one job.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub slice_nr: u64,
    pub stream: usize,
    pub payload: ChunkPayload,
}

/// Receiving end of a station's sample link, handed to the worker when the
/// station connects.
#[derive(Debug)]
pub struct SampleLink {
    pub station: usize,
    pub chunks: mpsc::Receiver<DataChunk>,
}

/// Worker inbox. Samples travel on per-station links so a full stream queue
/// holds back only the station that feeds it, never the control path.
#[derive(Debug)]
pub enum WorkerInput {
    Control(WorkerMessage),
    Link(SampleLink),
}

#[derive(Debug, Clone)]
pub enum StationMessage {
    Connect(ConnectionSetup),
    Deliver(DeliveryRequest),
    Stop,
}

#[derive(Debug, Clone)]
pub enum OutputMessage {
    Record {
        phase_center: Option<usize>,
        record: OutputRecord,
    },
    SliceComplete {
        slice_nr: u64,
    },
    SliceFailed {
        slice_nr: u64,
        reason: String,
    },
    /// Total number of slices assigned in the run.
    Finish {
        total_slices: u64,
    },
    Stop,
}
