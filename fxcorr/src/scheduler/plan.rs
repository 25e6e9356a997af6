//! Dry run of the scheduler's scan and slice walk, for `fxcorr check`.

use std::sync::Arc;

use serde::Serialize;

use super::context::{ScanStart, SchedulerContext, SliceAdvance};
use super::expander::JobExpander;
use crate::config::CorrelationConfig;

/// A job as it would be numbered by a real run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedJob {
    pub slice_nr: u64,
    pub scan: String,
    pub start: String,
    pub stop: String,
    pub channel: String,
    pub cross_channel: Option<String>,
    pub streams: usize,
    pub bins: Option<usize>,
    pub phase_center: Option<String>,
}

/// Every job of the run in assignment order.
pub fn plan(config: Arc<CorrelationConfig>) -> Vec<PlannedJob> {
    let expander = JobExpander::new(config.clone());
    let mut context = SchedulerContext::new(&config);
    let mut jobs = Vec::new();

    'scans: loop {
        match context.start_scan(&config.scans) {
            ScanStart::Started { .. } => {}
            ScanStart::Skipped => continue,
            ScanStart::Exhausted => break,
        }
        loop {
            let slice = context.current_slice();
            let channels = &config.scans[slice.scan].mode.channels;
            for cursor in 0..expander.channel_count(&slice) {
                for job in expander.expand(&slice, cursor) {
                    jobs.push(PlannedJob {
                        slice_nr: context.take_slice_nr(),
                        scan: job.scan_name,
                        start: job.slice.start.to_string(),
                        stop: job.slice.stop.to_string(),
                        channel: channels[job.channel].name.clone(),
                        cross_channel: job.cross_channel.map(|c| channels[c].name.clone()),
                        streams: job.streams.len(),
                        bins: job.pulsar.map(|(_, bins)| bins),
                        phase_center: job.phase_center.map(|p| p.source),
                    });
                }
            }
            match context.advance_slice() {
                SliceAdvance::SameScan => continue,
                SliceAdvance::NextScan => continue 'scans,
                SliceAdvance::Stop => break 'scans,
            }
        }
    }
    jobs
}
