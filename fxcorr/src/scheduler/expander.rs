//! Job expansion: one `(time slice, channel)` pair becomes zero or more jobs
//! under the cross-polarisation, pulsar-binning and multi-phase-center
//! policies.

use std::collections::BTreeSet;
use std::sync::Arc;

use correlation_core::StreamSpec;
use tracing::warn;

use super::context::TimeSlice;
use super::messages::{JobAssignment, PhaseCenter};
use crate::config::{CorrelationConfig, Scan};

/// One unit of work, not yet numbered.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub scan_index: usize,
    pub scan_name: String,
    pub slice: TimeSlice,
    pub channel: usize,
    pub cross_channel: Option<usize>,
    pub streams: Vec<StreamSpec>,
    pub pulsar: Option<(String, usize)>,
    pub phase_center: Option<PhaseCenter>,
}

impl Job {
    pub fn assignment(&self, slice_nr: u64) -> JobAssignment {
        JobAssignment {
            slice_nr,
            scan_index: self.scan_index,
            scan_id: self.scan_name.clone(),
            time_slice_start: self.slice.start,
            time_slice_stop: self.slice.stop,
            channel_id: self.channel,
            cross_channel_id: self.cross_channel,
            station_stream_list: self.streams.clone(),
            pulsar: self.pulsar.clone(),
            phase_center: self.phase_center.clone(),
        }
    }
}

pub struct JobExpander {
    config: Arc<CorrelationConfig>,
    /// Phase centers of every scan, computed once.
    scan_sources: Vec<Vec<PhaseCenter>>,
}

impl JobExpander {
    pub fn new(config: Arc<CorrelationConfig>) -> Self {
        let scan_sources = config
            .scans
            .iter()
            .map(|scan| {
                scan.sources
                    .iter()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .filter_map(|name| {
                        config.source_index(name).map(|index| PhaseCenter {
                            index,
                            source: name.clone(),
                        })
                    })
                    .collect()
            })
            .collect();
        Self {
            config,
            scan_sources,
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Number of channels the cursor walks over in the slice's scan.
    pub fn channel_count(&self, slice: &TimeSlice) -> usize {
        self.config
            .scans
            .get(slice.scan)
            .map_or(0, |s| s.mode.channels.len())
    }

    /// Jobs for channel `cursor` of `slice`. Depends only on the arguments
    /// and the configuration.
    pub fn expand(&self, slice: &TimeSlice, cursor: usize) -> Vec<Job> {
        let Some(scan) = self.config.scans.get(slice.scan) else {
            return Vec::new();
        };
        let Some(channel) = scan.mode.channels.get(cursor) else {
            return Vec::new();
        };
        let policy = self.config.policy;

        // consumed as the partner of a lower channel
        if policy.cross_polarize && channel.partner_of.is_some() {
            return Vec::new();
        }
        // never straddle a delay-table break
        if !self.delays_cover(scan, slice) {
            warn!(
                scan = %scan.name,
                slice_start = %slice.start,
                channel = %channel.name,
                "Delay tables do not cover the slice, skipping"
            );
            return Vec::new();
        }

        let cross_channel = if policy.cross_polarize {
            channel.cross_channel
        } else {
            None
        };
        let mut streams = self.streams(scan, channel.polarisation);
        if let Some(cross) = cross_channel {
            let pol = scan.mode.channels[cross].polarisation;
            streams.extend(self.streams(scan, pol));
        }

        let pulsar = if policy.pulsar_binning {
            self.config
                .scan_pulsar(scan)
                .map(|(name, model)| (name.to_string(), model.nbins + 1))
        } else {
            None
        };

        let job = Job {
            scan_index: slice.scan,
            scan_name: scan.name.clone(),
            slice: *slice,
            channel: cursor,
            cross_channel,
            streams,
            pulsar,
            phase_center: None,
        };

        if policy.multi_phase_center {
            self.scan_sources[slice.scan]
                .iter()
                .map(|center| Job {
                    phase_center: Some(center.clone()),
                    ..job.clone()
                })
                .collect()
        } else {
            vec![job]
        }
    }

    fn streams(&self, scan: &Scan, polarisation: correlation_core::Polarisation) -> Vec<StreamSpec> {
        scan.stations
            .iter()
            .map(|&station| StreamSpec {
                station,
                polarisation,
            })
            .collect()
    }

    fn delays_cover(&self, scan: &Scan, slice: &TimeSlice) -> bool {
        scan.stations
            .iter()
            .all(|&s| self.config.stations[s].delay.covers(slice.start, slice.stop))
    }
}
