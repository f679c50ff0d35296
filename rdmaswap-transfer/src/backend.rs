use std::time::Duration;

use crate::{
    api::{RemoteSlot, TransportConfig, PAGE_SIZE},
    error::Result,
};

/// A one-sided page transport bound to a single remote peer.
///
/// Implementations serialize callers internally: one work request is
/// outstanding on the queue pair at a time.
pub trait RdmaBackend: Send + Sync {
    /// Opens the device and builds PD, CQ, QP and the staging buffer. On
    /// failure nothing stays allocated.
    fn initialize(&self, config: TransportConfig) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// RDMA READ of one page at `remote` into `dst`; blocks until the
    /// completion arrives or `timeout` elapses.
    fn read_page(&self, dst: &mut [u8; PAGE_SIZE], remote: RemoteSlot, timeout: Duration)
        -> Result<()>;

    /// RDMA WRITE of one page from `src` to `remote`.
    fn write_page(&self, src: &[u8; PAGE_SIZE], remote: RemoteSlot, timeout: Duration)
        -> Result<()>;

    /// Destroys QP, CQ, MR, PD and device context in that order. Safe to call
    /// repeatedly or before `initialize`.
    fn cleanup(&self);
}

impl<B: RdmaBackend + ?Sized> RdmaBackend for Box<B> {
    fn initialize(&self, config: TransportConfig) -> Result<()> {
        (**self).initialize(config)
    }

    fn is_initialized(&self) -> bool {
        (**self).is_initialized()
    }

    fn read_page(
        &self,
        dst: &mut [u8; PAGE_SIZE],
        remote: RemoteSlot,
        timeout: Duration,
    ) -> Result<()> {
        (**self).read_page(dst, remote, timeout)
    }

    fn write_page(&self, src: &[u8; PAGE_SIZE], remote: RemoteSlot, timeout: Duration) -> Result<()> {
        (**self).write_page(src, remote, timeout)
    }

    fn cleanup(&self) {
        (**self).cleanup()
    }
}
