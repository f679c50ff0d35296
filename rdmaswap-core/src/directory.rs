// ============================================================================
// Remote page directory
// - Fixed table of `capacity` slots, preallocated. Slot i always maps to page i
//   of the remote region; only the local id and the state change.
// - Slot life: Free -> Writing (reserved, data in flight) -> Valid, and back
//   to Free on remove or on a failed write. Removing a Writing slot marks it
//   Cancelled; the owning store frees it once its write has finished. Only
//   Valid slots are returned by lookups.
// - At most one non-free slot per local id, with at most one write in flight.
//   A store of an id whose write is still in flight is refused; a store of a
//   Valid id rewrites its slot.
// - The table lock covers scan-and-mark only; RDMA I/O always runs with the
//   lock released. A slot with a write in flight never returns to the free
//   pool, so no other id can be given its remote page. Every reservation and
//   release bumps the slot generation; a read is only returned if the
//   generation it started with is still current.
// ============================================================================

use std::fmt;

use parking_lot::RwLock;
use rdmaswap_transfer::{RdmaBackend, RemoteRegion, RemoteSlot, TransferEngine};
use tracing::{debug, warn};

use crate::{
    config::IndexKind,
    error::{Result, SwapError},
    index::SlotIndex,
    page::Page,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    Free,
    Writing,
    /// Removed while its write was in flight.
    Cancelled,
    Valid,
}

/// One directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemotePageEntry {
    pub local_id: u64,
    pub remote_addr: u64,
    pub access_key: u32,
    pub state: EntryState,
    pub generation: u64,
}

impl RemotePageEntry {
    pub(crate) fn table(region: &RemoteRegion, capacity: usize) -> Vec<Self> {
        (0..capacity)
            .filter_map(|index| region.slot(index))
            .map(|slot| Self {
                local_id: 0,
                remote_addr: slot.addr,
                access_key: slot.rkey,
                state: EntryState::Free,
                generation: 0,
            })
            .collect()
    }

    fn remote(&self) -> RemoteSlot {
        RemoteSlot {
            addr: self.remote_addr,
            rkey: self.access_key,
        }
    }
}

/// A valid entry as reported by [`RemotePageDirectory::entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub index: usize,
    pub local_id: u64,
    pub remote_addr: u64,
    pub access_key: u32,
}

impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry {}: addr={:#x} remote={:#x} rkey={:x}",
            self.index, self.local_id, self.remote_addr, self.access_key
        )
    }
}

struct Table {
    entries: Vec<RemotePageEntry>,
    index: Box<dyn SlotIndex>,
    valid: usize,
}

impl Table {
    fn release(&mut self, slot: usize) {
        let entry = &mut self.entries[slot];
        if entry.state == EntryState::Valid {
            self.valid -= 1;
        }
        entry.state = EntryState::Free;
        entry.generation = entry.generation.wrapping_add(1);
        let local_id = entry.local_id;
        self.index.release(local_id, slot);
    }
}

pub struct RemotePageDirectory {
    capacity: usize,
    table: RwLock<Table>,
}

impl RemotePageDirectory {
    /// Builds an empty directory over the first `capacity` pages of `region`.
    pub fn new(capacity: usize, region: RemoteRegion, index: IndexKind) -> Result<Self> {
        if capacity == 0 {
            return Err(SwapError::InvalidConfig("capacity must be non-zero"));
        }
        if region.page_count() < capacity {
            return Err(SwapError::InvalidConfig(
                "remote region smaller than directory capacity",
            ));
        }
        Ok(Self {
            capacity,
            table: RwLock::new(Table {
                entries: RemotePageEntry::table(&region, capacity),
                index: index.build(capacity),
                valid: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        self.table.read().valid
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot index of the valid entry for `local_id`.
    pub fn lookup(&self, local_id: u64) -> Option<usize> {
        let table = self.table.read();
        table
            .index
            .slot_of(&table.entries, local_id)
            .filter(|slot| table.entries[*slot].state == EntryState::Valid)
    }

    pub fn exists(&self, local_id: u64) -> bool {
        self.lookup(local_id).is_some()
    }

    /// Writes `page` to the remote tier and records it under `local_id`.
    /// Returns the slot index used. `Ok` means the entry is valid at return.
    pub fn store<B: RdmaBackend>(
        &self,
        local_id: u64,
        page: &Page,
        engine: &TransferEngine<B>,
    ) -> Result<usize> {
        let (slot, remote, generation) = self.reserve(local_id)?;

        let result = engine.write_page(page.as_bytes(), remote);

        let mut table = self.table.write();
        let entry = table.entries[slot];
        debug_assert_eq!(entry.generation, generation);
        match result {
            Err(err) => {
                table.release(slot);
                warn!(local_id, slot, %err, "remote write failed, slot released");
                Err(SwapError::Io(err))
            }
            Ok(()) if entry.state == EntryState::Cancelled => {
                table.release(slot);
                debug!(local_id, slot, "store cancelled while in flight, slot released");
                Err(SwapError::StoreCancelled { local_id })
            }
            Ok(()) => {
                table.entries[slot].state = EntryState::Valid;
                table.valid += 1;
                debug!(local_id, slot, addr = remote.addr, "page stored");
                Ok(slot)
            }
        }
    }

    /// Reserves the slot for `local_id`: the one already bound to it, or the
    /// first free one.
    fn reserve(&self, local_id: u64) -> Result<(usize, RemoteSlot, u64)> {
        let mut table = self.table.write();
        let slot = match table.index.slot_of(&table.entries, local_id) {
            Some(slot) if table.entries[slot].state == EntryState::Valid => {
                table.valid -= 1;
                slot
            }
            Some(slot) => {
                debug!(local_id, slot, "store refused, write already in flight");
                return Err(SwapError::StoreInFlight { local_id });
            }
            None => {
                let Some(slot) = table.index.first_free(&table.entries) else {
                    warn!(local_id, capacity = self.capacity, "remote page directory full");
                    return Err(SwapError::ResourceExhausted {
                        capacity: self.capacity,
                    });
                };
                table.index.bind(local_id, slot);
                slot
            }
        };

        let entry = &mut table.entries[slot];
        entry.local_id = local_id;
        entry.state = EntryState::Writing;
        entry.generation = entry.generation.wrapping_add(1);
        Ok((slot, entry.remote(), entry.generation))
    }

    /// Reads the page stored under `local_id` into a fresh frame. An entry
    /// removed or rewritten while the read was in flight reads as absent.
    pub fn get<B: RdmaBackend>(&self, local_id: u64, engine: &TransferEngine<B>) -> Result<Page> {
        let found = {
            let table = self.table.read();
            table
                .index
                .slot_of(&table.entries, local_id)
                .map(|slot| (slot, table.entries[slot]))
                .filter(|(_, entry)| entry.state == EntryState::Valid)
        };
        let Some((slot, entry)) = found else {
            return Err(SwapError::NotFound { local_id });
        };

        let mut page = Page::zeroed();
        engine
            .read_page(page.as_bytes_mut(), entry.remote())
            .map_err(SwapError::Io)?;

        let table = self.table.read();
        let current = &table.entries[slot];
        if current.state != EntryState::Valid || current.generation != entry.generation {
            debug!(local_id, slot, "entry changed during read");
            return Err(SwapError::NotFound { local_id });
        }
        Ok(page)
    }

    /// Drops the entry for `local_id`. An in-flight store of the id is
    /// cancelled: it will not commit and its slot stays reserved until the
    /// write finishes. Returns whether a valid entry existed.
    pub fn remove(&self, local_id: u64) -> bool {
        let mut table = self.table.write();
        let Some(slot) = table.index.slot_of(&table.entries, local_id) else {
            return false;
        };
        let state = table.entries[slot].state;
        match state {
            EntryState::Valid => {
                table.release(slot);
                debug!(local_id, slot, "entry removed");
                true
            }
            EntryState::Writing => {
                table.entries[slot].state = EntryState::Cancelled;
                debug!(local_id, slot, "in-flight store cancelled");
                false
            }
            EntryState::Cancelled | EntryState::Free => false,
        }
    }

    /// Snapshot of all valid entries in slot order.
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        let table = self.table.read();
        table
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state == EntryState::Valid)
            .map(|(index, entry)| DirectoryEntry {
                index,
                local_id: entry.local_id,
                remote_addr: entry.remote_addr,
                access_key: entry.access_key,
            })
            .collect()
    }

    /// Writes one line per valid entry to `sink`.
    pub fn dump(&self, sink: &mut impl fmt::Write) -> fmt::Result {
        for entry in self.entries() {
            writeln!(sink, "{entry}")?;
        }
        Ok(())
    }
}
