use std::time::{Duration, Instant};

use tracing::debug;

use crate::{
    api::{RemoteSlot, TransportConfig, DEFAULT_COMPLETION_TIMEOUT, PAGE_SIZE},
    backend::RdmaBackend,
    error::{Result, TransferError},
};

/// Page transport front end: argument checks, the completion timeout and
/// latency logging around an [`RdmaBackend`].
pub struct TransferEngine<B: RdmaBackend> {
    backend: B,
    completion_timeout: Duration,
}

impl<B: RdmaBackend> TransferEngine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn completion_timeout(&self) -> Duration {
        self.completion_timeout
    }

    pub fn initialize(&self, config: TransportConfig) -> Result<()> {
        if config.cq_depth == 0 {
            return Err(TransferError::InvalidArgument("cq_depth must be non-zero"));
        }
        if self.completion_timeout.is_zero() {
            return Err(TransferError::InvalidArgument(
                "completion timeout must be non-zero",
            ));
        }
        self.backend.initialize(config)
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_initialized()
    }

    pub fn read_page(&self, dst: &mut [u8; PAGE_SIZE], remote: RemoteSlot) -> Result<()> {
        Self::check_remote(remote)?;
        let started_at = Instant::now();
        let result = self.backend.read_page(dst, remote, self.completion_timeout);
        debug!(
            addr = remote.addr,
            ok = result.is_ok(),
            elapsed_us = started_at.elapsed().as_micros() as u64,
            "read_page"
        );
        result
    }

    pub fn write_page(&self, src: &[u8; PAGE_SIZE], remote: RemoteSlot) -> Result<()> {
        Self::check_remote(remote)?;
        let started_at = Instant::now();
        let result = self.backend.write_page(src, remote, self.completion_timeout);
        debug!(
            addr = remote.addr,
            ok = result.is_ok(),
            elapsed_us = started_at.elapsed().as_micros() as u64,
            "write_page"
        );
        result
    }

    /// Reads several pages back to back. Stops at the first failure.
    pub fn batch_read_pages(
        &self,
        dsts: &mut [&mut [u8; PAGE_SIZE]],
        remotes: &[RemoteSlot],
    ) -> Result<usize> {
        if dsts.len() != remotes.len() {
            return Err(TransferError::BatchLengthMismatch {
                pages: dsts.len(),
                slots: remotes.len(),
            });
        }

        let started_at = Instant::now();
        for (dst, remote) in dsts.iter_mut().zip(remotes.iter().copied()) {
            self.read_page(dst, remote)?;
        }
        let transferred = remotes.len() * PAGE_SIZE;

        let elapsed_secs = started_at.elapsed().as_secs_f64();
        if elapsed_secs > 0.0 {
            let gib_per_sec = (transferred as f64) / elapsed_secs / (1024.0 * 1024.0 * 1024.0);
            debug!(
                "batch_read_pages bandwidth: bytes={}, pages={}, elapsed_ms={:.3}, bw_gibps={:.3}",
                transferred,
                remotes.len(),
                elapsed_secs * 1000.0,
                gib_per_sec
            );
        }
        Ok(transferred)
    }

    pub fn cleanup(&self) {
        self.backend.cleanup();
    }

    fn check_remote(remote: RemoteSlot) -> Result<()> {
        if remote.addr == 0 {
            return Err(TransferError::InvalidArgument("remote addr must be non-zero"));
        }
        if remote.addr % PAGE_SIZE as u64 != 0 {
            return Err(TransferError::InvalidArgument(
                "remote addr must be page aligned",
            ));
        }
        Ok(())
    }
}
