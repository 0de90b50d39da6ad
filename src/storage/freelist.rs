//! # Free-Slot Tracking
//!
//! Per-file bookkeeping of freed chunks. When a record is removed or
//! overwritten, its chunk is not reclaimed - it is flagged free on disk and
//! tracked here so a later write of the same or smaller size can reuse it.
//!
//! ## Allocation Strategy
//!
//! Best fit: `take(need)` returns the smallest free chunk whose capacity is
//! at least `need`. A reused chunk keeps its original capacity, so the
//! unused tail becomes slack inside the chunk - that slack, together with
//! free chunks no write ever fits into, is exactly the fragmentation the
//! maintenance pass exists to reclaim.
//!
//! ## Persistence
//!
//! The free list is not persisted separately. It is rebuilt from the
//! file's own chunk headers by the open-time scan, the same
//! rebuild-from-the-file model the engine uses for its key index; there is
//! no side structure that could disagree with the chunks themselves.
//!
//! ## Thread Safety
//!
//! Not thread-safe on its own; the storage engine serializes access behind
//! its state lock.

use std::collections::BTreeMap;

/// One file's freed chunks, ordered by capacity for best-fit lookup.
#[derive(Debug, Default)]
pub struct FreeList {
    by_capacity: BTreeMap<u32, Vec<u64>>,
    total_capacity: u64,
    slots: usize,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freed chunk of `capacity` payload bytes at `offset`.
    pub fn insert(&mut self, offset: u64, capacity: u32) {
        self.by_capacity.entry(capacity).or_default().push(offset);
        self.total_capacity += capacity as u64;
        self.slots += 1;
    }

    /// Takes the best-fitting free chunk for a payload of `need` bytes:
    /// the smallest capacity >= need. Returns `(offset, capacity)`.
    pub fn take(&mut self, need: u32) -> Option<(u64, u32)> {
        let capacity = *self.by_capacity.range(need..).next()?.0;

        let offsets = self
            .by_capacity
            .get_mut(&capacity)
            .expect("capacity bucket exists, it was just found by range lookup");
        let offset = offsets.pop().expect("capacity buckets are never empty");
        if offsets.is_empty() {
            self.by_capacity.remove(&capacity);
        }

        self.total_capacity -= capacity as u64;
        self.slots -= 1;
        Some((offset, capacity))
    }

    pub fn clear(&mut self) {
        self.by_capacity.clear();
        self.total_capacity = 0;
        self.slots = 0;
    }

    /// Total payload capacity sitting in free chunks.
    pub fn total_capacity(&self) -> u64 {
        self.total_capacity
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }
}
