use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytesize::ByteSize;
use rdmaswap_transfer::PAGE_SIZE;

#[derive(Debug, Default)]
pub(crate) struct SwapCounters {
    pub(crate) stores: AtomicU64,
    pub(crate) store_failures: AtomicU64,
    pub(crate) fetches: AtomicU64,
    pub(crate) fetch_misses: AtomicU64,
    pub(crate) fetch_failures: AtomicU64,
    pub(crate) invalidations: AtomicU64,
}

impl SwapCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, resident_pages: usize, capacity: usize) -> SwapStats {
        SwapStats {
            stores: self.stores.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_misses: self.fetch_misses.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            resident_pages,
            capacity,
        }
    }
}

/// Point-in-time view of swap activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    pub stores: u64,
    pub store_failures: u64,
    /// Successful page-ins.
    pub fetches: u64,
    pub fetch_misses: u64,
    pub fetch_failures: u64,
    pub invalidations: u64,
    pub resident_pages: usize,
    /// Directory capacity; zero while the tier is not initialized.
    pub capacity: usize,
}

impl SwapStats {
    pub fn resident_bytes(&self) -> ByteSize {
        ByteSize::b((self.resident_pages * PAGE_SIZE) as u64)
    }

    pub fn capacity_bytes(&self) -> ByteSize {
        ByteSize::b((self.capacity * PAGE_SIZE) as u64)
    }
}

impl fmt::Display for SwapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resident={}/{} ({} of {}) stores={} store_failures={} fetches={} misses={} fetch_failures={} invalidations={}",
            self.resident_pages,
            self.capacity,
            self.resident_bytes(),
            self.capacity_bytes(),
            self.stores,
            self.store_failures,
            self.fetches,
            self.fetch_misses,
            self.fetch_failures,
            self.invalidations
        )
    }
}
