// Frame buffer pool: a fixed arena of equally sized slots with a free list.
//
// Pipeline stages hold `SlotId`s, never references, and hand slots back
// explicitly once consumed. The arena never grows, so its capacity bounds the
// memory a worker uses and throttles frame assembly.

use tracing::debug;

/// Index of a slot in a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

/// Statistics for buffer pool operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Number of slots that had to be allocated
    pub allocations: u64,
    /// Number of acquisitions served by an already allocated slot
    pub reuses: u64,
    /// Slots currently handed out
    pub in_use: usize,
    /// Fixed number of slots
    pub capacity: usize,
}

/// Fixed-capacity pool of `slot_len`-element buffers.
///
/// Slots are allocated on first use and reset to `T::default()` when they are
/// released, so a freshly acquired slot never carries data from a previous
/// frame.
#[derive(Debug)]
pub struct BufferPool<T> {
    slots: Vec<Vec<T>>,
    in_use: Vec<bool>,
    free: Vec<SlotId>,
    slot_len: usize,
    allocations: u64,
    reuses: u64,
}

impl<T: Clone + Default> BufferPool<T> {
    pub fn new(capacity: usize, slot_len: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Vec::new()).collect(),
            in_use: vec![false; capacity],
            // popped from the back, so slot 0 is handed out first
            free: (0..capacity).rev().map(SlotId).collect(),
            slot_len,
            allocations: 0,
            reuses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Takes a slot off the free list, `None` when the pool is exhausted.
    pub fn acquire(&mut self) -> Option<SlotId> {
        let id = self.free.pop()?;
        let slot = &mut self.slots[id.0];
        if slot.is_empty() {
            slot.resize(self.slot_len, T::default());
            self.allocations += 1;
        } else {
            self.reuses += 1;
        }
        self.in_use[id.0] = true;
        Some(id)
    }

    /// Returns a slot to the pool. Releasing a slot that is not in use is
    /// ignored and reported as `false`.
    pub fn release(&mut self, id: SlotId) -> bool {
        match self.in_use.get_mut(id.0) {
            Some(in_use) if *in_use => {
                *in_use = false;
                self.slots[id.0].fill(T::default());
                self.free.push(id);
                true
            }
            _ => {
                debug!(slot = id.0, "Ignoring release of a free slot");
                false
            }
        }
    }

    pub fn get(&self, id: SlotId) -> &[T] {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut [T] {
        &mut self.slots[id.0]
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocations: self.allocations,
            reuses: self.reuses,
            in_use: self.capacity() - self.free.len(),
            capacity: self.capacity(),
        }
    }
}
