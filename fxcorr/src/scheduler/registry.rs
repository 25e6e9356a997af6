//! Scheduler-side bookkeeping of worker readiness and link setup.

use std::collections::VecDeque;

use super::barrier::ConnectionBarrier;
use super::messages::{WorkerId, WorkerStatus};
use crate::config::SchedulingMode;

#[derive(Debug, Clone, Copy)]
struct WorkerEntry {
    status: WorkerStatus,
    /// Excluded from the run after a failed connection setup.
    disabled: bool,
    current_slice: Option<u64>,
}

#[derive(Debug)]
pub struct ReadinessRegistry {
    workers: Vec<WorkerEntry>,
    /// Ready workers in the order they reported.
    ready_queue: VecDeque<WorkerId>,
    mode: SchedulingMode,
    /// Next worker in deterministic mode.
    round_robin: WorkerId,
    barrier: Option<ConnectionBarrier>,
}

impl ReadinessRegistry {
    /// All workers start busy until they report ready.
    pub fn new(n_workers: usize, mode: SchedulingMode) -> Self {
        Self {
            workers: vec![
                WorkerEntry {
                    status: WorkerStatus::Busy,
                    disabled: false,
                    current_slice: None,
                };
                n_workers
            ],
            ready_queue: VecDeque::with_capacity(n_workers),
            mode,
            round_robin: 0,
            barrier: None,
        }
    }

    /// Marks a worker ready. Returns false when it was already ready, is
    /// disabled or unknown.
    pub fn mark_ready(&mut self, id: WorkerId) -> bool {
        let Some(entry) = self.workers.get_mut(id) else {
            return false;
        };
        if entry.disabled || entry.status == WorkerStatus::Ready {
            return false;
        }
        entry.status = WorkerStatus::Ready;
        entry.current_slice = None;
        self.ready_queue.push_back(id);
        true
    }

    /// Moves a ready worker to busy on `slice_nr`. Fails if the worker is not
    /// ready or its links are not all up.
    pub fn assign(&mut self, id: WorkerId, slice_nr: u64) -> bool {
        if self.pending_connections(id) > 0 {
            return false;
        }
        let Some(entry) = self.workers.get_mut(id) else {
            return false;
        };
        if entry.disabled || entry.status != WorkerStatus::Ready {
            return false;
        }
        entry.status = WorkerStatus::Busy;
        entry.current_slice = Some(slice_nr);
        self.ready_queue.retain(|&w| w != id);
        if self.mode == SchedulingMode::Deterministic {
            self.round_robin = self.next_active(id + 1);
        }
        true
    }

    /// Worker that should get the next job, if any may take one now.
    pub fn next_ready(&self) -> Option<WorkerId> {
        if !self.connections_complete() {
            return None;
        }
        match self.mode {
            SchedulingMode::Fifo => self.ready_queue.front().copied(),
            SchedulingMode::Deterministic => {
                let id = self.round_robin;
                self.is_ready(id).then_some(id)
            }
        }
    }

    pub fn is_ready(&self, id: WorkerId) -> bool {
        self.workers
            .get(id)
            .is_some_and(|w| !w.disabled && w.status == WorkerStatus::Ready)
    }

    pub fn current_slice(&self, id: WorkerId) -> Option<u64> {
        self.workers.get(id).and_then(|w| w.current_slice)
    }

    /// Installs the barrier the workers' links are counted down on.
    pub fn begin_connections(&mut self, barrier: ConnectionBarrier) {
        self.barrier = Some(barrier);
    }

    pub fn barrier_mut(&mut self) -> Option<&mut ConnectionBarrier> {
        self.barrier.as_mut()
    }

    /// Links of `id` not yet acknowledged.
    pub fn pending_connections(&self, id: WorkerId) -> usize {
        self.barrier.as_ref().map_or(0, |b| b.pending_for(id))
    }

    pub fn connections_complete(&self) -> bool {
        self.barrier.as_ref().is_none_or(ConnectionBarrier::is_complete)
    }

    /// Removes a worker from the run.
    pub fn disable(&mut self, id: WorkerId) {
        let Some(entry) = self.workers.get_mut(id) else {
            return;
        };
        entry.disabled = true;
        self.ready_queue.retain(|&w| w != id);
        if let Some(barrier) = self.barrier.as_mut() {
            barrier.drop_worker(id);
        }
        if self.round_robin == id {
            self.round_robin = self.next_active(id + 1);
        }
    }

    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.disabled).count()
    }

    pub fn disabled_workers(&self) -> Vec<WorkerId> {
        (0..self.workers.len())
            .filter(|&id| self.workers[id].disabled)
            .collect()
    }

    /// First active worker at or after `from`, wrapping around.
    fn next_active(&self, from: WorkerId) -> WorkerId {
        let n = self.workers.len();
        (0..n)
            .map(|k| (from + k) % n)
            .find(|&id| !self.workers[id].disabled)
            .unwrap_or(0)
    }
}
