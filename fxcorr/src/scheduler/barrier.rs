//! Count-down barrier over the links a run must bring up before the first
//! job is assigned.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use super::messages::{LinkKey, WorkerId};

#[derive(Debug)]
pub struct ConnectionBarrier {
    expected: HashSet<LinkKey>,
    deadline: Instant,
}

impl ConnectionBarrier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            expected: HashSet::new(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn expect(&mut self, key: LinkKey) {
        self.expected.insert(key);
    }

    /// Counts one acknowledgement down. Returns false for links the barrier
    /// was not waiting on.
    pub fn acknowledge(&mut self, key: &LinkKey) -> bool {
        self.expected.remove(key)
    }

    pub fn remaining(&self) -> usize {
        self.expected.len()
    }

    /// Links of `worker_id` still waiting for an acknowledgement.
    pub fn pending_for(&self, worker_id: WorkerId) -> usize {
        self.expected
            .iter()
            .filter(|k| k.worker_id == worker_id)
            .count()
    }

    /// Workers with at least one outstanding link, sorted.
    pub fn pending_workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<_> = self
            .expected
            .iter()
            .map(|k| k.worker_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        workers.sort_unstable();
        workers
    }

    pub fn is_complete(&self) -> bool {
        self.expected.is_empty()
    }

    /// Stops waiting on any link of `worker_id`.
    pub fn drop_worker(&mut self, worker_id: WorkerId) {
        self.expected.retain(|k| k.worker_id != worker_id);
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}
