//! Slot lookup strategies for the remote page directory.
//!
//! The directory owns the slot table; an index only answers two questions
//! about it: which slot holds a given local id, and which free slot comes
//! first. Both strategies return the same answers for the same table, so the
//! choice is invisible to callers.

use std::collections::BTreeSet;

use ahash::AHashMap;

use crate::{
    config::IndexKind,
    directory::{EntryState, RemotePageEntry},
};

pub trait SlotIndex: Send + Sync {
    /// Slot holding `local_id` in any non-free state.
    fn slot_of(&self, entries: &[RemotePageEntry], local_id: u64) -> Option<usize>;

    /// Lowest-numbered free slot.
    fn first_free(&self, entries: &[RemotePageEntry]) -> Option<usize>;

    /// `slot` was taken for `local_id`.
    fn bind(&mut self, local_id: u64, slot: usize);

    /// `slot`, previously bound to `local_id`, is free again.
    fn release(&mut self, local_id: u64, slot: usize);
}

impl IndexKind {
    pub(crate) fn build(self, capacity: usize) -> Box<dyn SlotIndex> {
        match self {
            IndexKind::Linear => Box::new(LinearScan),
            IndexKind::Hashed => Box::new(HashedIndex::new(capacity)),
        }
    }
}

/// Stateless full-table scan.
#[derive(Debug, Default)]
pub struct LinearScan;

impl SlotIndex for LinearScan {
    fn slot_of(&self, entries: &[RemotePageEntry], local_id: u64) -> Option<usize> {
        entries
            .iter()
            .position(|entry| entry.state != EntryState::Free && entry.local_id == local_id)
    }

    fn first_free(&self, entries: &[RemotePageEntry]) -> Option<usize> {
        entries
            .iter()
            .position(|entry| entry.state == EntryState::Free)
    }

    fn bind(&mut self, _local_id: u64, _slot: usize) {}

    fn release(&mut self, _local_id: u64, _slot: usize) {}
}

#[derive(Debug)]
pub struct HashedIndex {
    slots: AHashMap<u64, usize>,
    free: BTreeSet<usize>,
}

impl HashedIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: AHashMap::with_capacity(capacity),
            free: (0..capacity).collect(),
        }
    }
}

impl SlotIndex for HashedIndex {
    fn slot_of(&self, _entries: &[RemotePageEntry], local_id: u64) -> Option<usize> {
        self.slots.get(&local_id).copied()
    }

    fn first_free(&self, _entries: &[RemotePageEntry]) -> Option<usize> {
        self.free.first().copied()
    }

    fn bind(&mut self, local_id: u64, slot: usize) {
        self.free.remove(&slot);
        self.slots.insert(local_id, slot);
    }

    fn release(&mut self, local_id: u64, slot: usize) {
        if self.slots.get(&local_id) == Some(&slot) {
            self.slots.remove(&local_id);
        }
        self.free.insert(slot);
    }
}
