//! Scheduler clock and cursor state.
//!
//! Slices live on a global grid: slice `n` starts at
//! `global_start + n * integration_time`. A scan's usable stop is the scan
//! stop clipped to the global stop, then truncated to a whole number of
//! slices counted from the first slice of the scan; the remainder is dropped.

use std::collections::VecDeque;

use delay_model::Time;

use super::expander::Job;
use crate::config::{CorrelationConfig, Scan};

/// `[start, stop)` of one integration inside a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlice {
    pub scan: usize,
    pub start: Time,
    pub stop: Time,
}

/// Outcome of entering the scan at the current scan index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStart {
    /// The scan has `slices` full slices starting at the current clock.
    Started { slices: i64 },
    /// No full slice fits; the scan index has moved on.
    Skipped,
    /// No scan left, or the scan ends before the clock.
    Exhausted,
}

/// Outcome of moving the clock one slice forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceAdvance {
    SameScan,
    NextScan,
    Stop,
}

/// All mutable scheduler state, owned by the scheduler task.
#[derive(Debug)]
pub struct SchedulerContext {
    global_start: Time,
    global_stop: Time,
    integration_us: i64,
    n_scans: usize,
    pub scan_index: usize,
    slice_index: i64,
    scan_stop: Time,
    /// Next channel of the current slice to expand.
    pub cursor: usize,
    /// Expanded jobs of the current slice waiting for a worker.
    pub pending: VecDeque<Job>,
    next_slice_nr: u64,
}

impl SchedulerContext {
    /// Starts at the first scan that has not ended by the global start.
    pub fn new(config: &CorrelationConfig) -> Self {
        let scan_index = config
            .scans
            .iter()
            .position(|s| s.stop > config.start)
            .unwrap_or(config.scans.len());
        Self {
            global_start: config.start,
            global_stop: config.stop,
            integration_us: config.integration_time_us,
            n_scans: config.scans.len(),
            scan_index,
            slice_index: 0,
            scan_stop: config.start,
            cursor: 0,
            pending: VecDeque::new(),
            next_slice_nr: 0,
        }
    }

    /// Start of the current slice.
    pub fn clock(&self) -> Time {
        self.global_start + self.integration_us * self.slice_index
    }

    pub fn current_slice(&self) -> TimeSlice {
        let start = self.clock();
        TimeSlice {
            scan: self.scan_index,
            start,
            stop: start + self.integration_us,
        }
    }

    /// Aligned stop of the current scan.
    pub fn scan_stop(&self) -> Time {
        self.scan_stop
    }

    pub fn start_scan(&mut self, scans: &[Scan]) -> ScanStart {
        let Some(scan) = scans.get(self.scan_index) else {
            return ScanStart::Exhausted;
        };
        let clock = self.clock();
        if scan.stop <= clock || clock >= self.global_stop {
            return ScanStart::Exhausted;
        }
        if clock < scan.start {
            // first slice at or after the scan start
            let offset = scan.start - self.global_start;
            self.slice_index = (offset + self.integration_us - 1).div_euclid(self.integration_us);
        }

        let begin = self.clock();
        let stop = scan.stop.min(self.global_stop);
        let slices = (stop - begin).max(0) / self.integration_us;
        self.scan_stop = begin + slices * self.integration_us;
        self.cursor = 0;
        self.pending.clear();

        if slices == 0 {
            self.scan_index += 1;
            return ScanStart::Skipped;
        }
        ScanStart::Started { slices }
    }

    pub fn start_slice(&mut self) {
        self.cursor = 0;
        self.pending.clear();
    }

    pub fn advance_slice(&mut self) -> SliceAdvance {
        self.slice_index += 1;
        let stop = self.clock() + self.integration_us;
        if stop > self.global_stop {
            SliceAdvance::Stop
        } else if stop > self.scan_stop {
            self.scan_index += 1;
            if self.scan_index >= self.n_scans {
                SliceAdvance::Stop
            } else {
                SliceAdvance::NextScan
            }
        } else {
            SliceAdvance::SameScan
        }
    }

    /// Hands out the next output slice number.
    pub fn take_slice_nr(&mut self) -> u64 {
        let nr = self.next_slice_nr;
        self.next_slice_nr += 1;
        nr
    }

    /// Output slice numbers handed out so far.
    pub fn slices_assigned(&self) -> u64 {
        self.next_slice_nr
    }
}
