use std::time::Duration;

use crate::peer_address::PeerAddress;

/// Size of one transferred page.
pub const PAGE_SIZE: usize = 4096;

/// Completion queue depth used when the configuration does not override it.
pub const DEFAULT_CQ_DEPTH: u32 = 16;

/// Upper bound on a single completion wait.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(2);

/// Target of one page transfer: remote address plus the rkey authorizing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteSlot {
    pub addr: u64,
    pub rkey: u32,
}

/// A memory region registered on the remote peer.
///
/// Obtained from the out-of-band registration exchange with the peer. Page
/// `i` of the region lives at `base_addr + i * PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    pub base_addr: u64,
    pub rkey: u32,
    pub len: u64,
}

impl RemoteRegion {
    /// Base address used when no peer exchange has supplied a real one.
    pub const PLACEHOLDER_BASE: u64 = 0xdead_beef_0000;
    pub const PLACEHOLDER_RKEY: u32 = 0x1234;

    pub fn new(base_addr: u64, rkey: u32, len: u64) -> Self {
        Self {
            base_addr,
            rkey,
            len,
        }
    }

    pub fn for_pages(base_addr: u64, rkey: u32, pages: usize) -> Self {
        Self::new(base_addr, rkey, (pages as u64) * PAGE_SIZE as u64)
    }

    /// Placeholder region large enough for `pages` pages.
    pub fn placeholder(pages: usize) -> Self {
        Self::for_pages(Self::PLACEHOLDER_BASE, Self::PLACEHOLDER_RKEY, pages)
    }

    pub fn page_count(&self) -> usize {
        (self.len / PAGE_SIZE as u64) as usize
    }

    pub fn slot(&self, index: usize) -> Option<RemoteSlot> {
        if index >= self.page_count() {
            return None;
        }
        Some(RemoteSlot {
            addr: self.base_addr + (index as u64) * PAGE_SIZE as u64,
            rkey: self.rkey,
        })
    }

    /// Page index of `addr` if a whole page starting there fits in the region.
    pub fn page_index(&self, addr: u64) -> Option<usize> {
        let offset = addr.checked_sub(self.base_addr)?;
        let end = offset.checked_add(PAGE_SIZE as u64)?;
        if end > self.len || offset % PAGE_SIZE as u64 != 0 {
            return None;
        }
        Some((offset / PAGE_SIZE as u64) as usize)
    }
}

/// Transport bring-up parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Device to open; the first device found when `None`.
    pub nic_name: Option<String>,
    /// Completion queue depth.
    pub cq_depth: u32,
    /// Pre-established remote endpoint the queue pair connects to.
    pub peer: Option<PeerAddress>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nic_name: None,
            cq_depth: DEFAULT_CQ_DEPTH,
            peer: None,
        }
    }
}

impl TransportConfig {
    pub fn with_nic(mut self, nic_name: impl Into<String>) -> Self {
        self.nic_name = Some(nic_name.into());
        self
    }

    pub fn with_cq_depth(mut self, cq_depth: u32) -> Self {
        self.cq_depth = cq_depth;
        self
    }

    pub fn with_peer(mut self, peer: PeerAddress) -> Self {
        self.peer = Some(peer);
        self
    }
}
