use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use parking_lot::RwLock;
use rdmaswap_transfer::{RdmaBackend, TransferEngine};
use tracing::{debug, error, info, warn};

use crate::{
    config::SwapConfig,
    directory::RemotePageDirectory,
    error::{Result, SwapError},
    page::Page,
    policy::SwapPolicy,
    stats::{SwapCounters, SwapStats},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SwapState {
    Uninitialized = 0,
    Ready = 1,
    ShuttingDown = 2,
}

impl SwapState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SwapState::Ready,
            2 => SwapState::ShuttingDown,
            _ => SwapState::Uninitialized,
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapState::Uninitialized => f.write_str("uninitialized"),
            SwapState::Ready => f.write_str("ready"),
            SwapState::ShuttingDown => f.write_str("shutting down"),
        }
    }
}

/// One remote swap tier: page directory, transport and policy behind a
/// lifecycle.
///
/// Data operations hold the lifecycle lock shared for their whole duration,
/// so `exit` waits for outstanding transfers before the transport is torn
/// down. Outside `Ready` every data operation fails with
/// [`SwapError::InvalidState`].
pub struct RdmaSwap<B: RdmaBackend> {
    config: SwapConfig,
    engine: TransferEngine<B>,
    policy: SwapPolicy,
    state: AtomicU8,
    directory: RwLock<Option<RemotePageDirectory>>,
    counters: SwapCounters,
}

impl<B: RdmaBackend> RdmaSwap<B> {
    /// Validates `config` and wraps `backend`. Nothing is allocated until
    /// [`RdmaSwap::init`].
    pub fn new(config: SwapConfig, backend: B) -> Result<Self> {
        config.validate()?;
        let engine =
            TransferEngine::new(backend).with_completion_timeout(config.completion_timeout);
        let policy = SwapPolicy::new(config.initial_ratio);
        Ok(Self {
            config,
            engine,
            policy,
            state: AtomicU8::new(SwapState::Uninitialized as u8),
            directory: RwLock::new(None),
            counters: SwapCounters::default(),
        })
    }

    pub fn config(&self) -> &SwapConfig {
        &self.config
    }

    pub fn transport(&self) -> &TransferEngine<B> {
        &self.engine
    }

    pub fn state(&self) -> SwapState {
        SwapState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SwapState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Allocates the directory and brings up the transport. On failure the
    /// tier stays uninitialized.
    pub fn init(&self) -> Result<()> {
        let mut guard = self.directory.write();
        let state = self.state();
        if state != SwapState::Uninitialized {
            error!(%state, "init rejected");
            return Err(SwapError::InvalidState { op: "init", state });
        }

        let region = self.config.remote_region();
        let directory = RemotePageDirectory::new(self.config.capacity, region, self.config.index)?;
        if let Err(err) = self.engine.initialize(self.config.transport.clone()) {
            warn!(%err, "remote swap transport bring-up failed");
            return Err(SwapError::TransportInit(err));
        }

        *guard = Some(directory);
        self.set_state(SwapState::Ready);
        self.policy.set_enabled(true);
        info!(
            capacity = self.config.capacity,
            index = %self.config.index,
            ratio = self.policy.get_ratio(),
            "remote swap tier ready, region base {:#x} rkey {:#x}",
            region.base_addr,
            region.rkey
        );
        Ok(())
    }

    /// Drains in-flight operations, drops the directory and tears down the
    /// transport. No-op unless `Ready`.
    pub fn exit(&self) {
        if self
            .state
            .compare_exchange(
                SwapState::Ready as u8,
                SwapState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(state = %self.state(), "exit skipped");
            return;
        }
        self.policy.set_enabled(false);

        let mut guard = self.directory.write();
        let resident = guard.take().map(|directory| directory.len()).unwrap_or(0);
        self.engine.cleanup();
        self.set_state(SwapState::Uninitialized);
        info!(resident, "remote swap tier shut down");
    }

    fn with_directory<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&RemotePageDirectory) -> Result<T>,
    ) -> Result<T> {
        let guard = self.directory.read();
        match (self.state(), guard.as_ref()) {
            (SwapState::Ready, Some(directory)) => f(directory),
            (state, _) => {
                error!(op, %state, "remote swap tier not ready");
                Err(SwapError::InvalidState { op, state })
            }
        }
    }

    /// Page-in: reads the page stored under `local_id`.
    pub fn try_get_page(&self, local_id: u64) -> Result<Page> {
        self.with_directory("try_get_page", |directory| {
            match directory.get(local_id, &self.engine) {
                Ok(page) => {
                    SwapCounters::bump(&self.counters.fetches);
                    Ok(page)
                }
                Err(err @ SwapError::NotFound { .. }) => {
                    SwapCounters::bump(&self.counters.fetch_misses);
                    debug!(local_id, "page-in miss");
                    Err(err)
                }
                Err(err) => {
                    SwapCounters::bump(&self.counters.fetch_failures);
                    warn!(local_id, %err, "page-in failed");
                    Err(err)
                }
            }
        })
    }

    /// Page-out: writes `page` to the remote tier under `local_id`.
    pub fn store_page(&self, local_id: u64, page: &Page) -> Result<()> {
        self.with_directory("store_page", |directory| {
            match directory.store(local_id, page, &self.engine) {
                Ok(_) => {
                    SwapCounters::bump(&self.counters.stores);
                    Ok(())
                }
                Err(err) => {
                    SwapCounters::bump(&self.counters.store_failures);
                    Err(err)
                }
            }
        })
    }

    /// `false` whenever the tier is not ready.
    pub fn page_exists(&self, local_id: u64) -> bool {
        let guard = self.directory.read();
        match (self.state(), guard.as_ref()) {
            (SwapState::Ready, Some(directory)) => directory.exists(local_id),
            _ => false,
        }
    }

    /// Forgets the remote copy of `local_id`, e.g. after the page was freed
    /// locally. Returns whether a copy existed.
    pub fn invalidate_page(&self, local_id: u64) -> Result<bool> {
        self.with_directory("invalidate_page", |directory| {
            let removed = directory.remove(local_id);
            if removed {
                SwapCounters::bump(&self.counters.invalidations);
            }
            Ok(removed)
        })
    }

    /// Whether the remote tier should be considered for swap traffic.
    pub fn use_rdma_swap(&self) -> bool {
        self.policy.use_remote_swap() && self.state() == SwapState::Ready
    }

    pub fn set_rdma_swap_ratio(&self, percent: i32) -> u8 {
        let stored = self.policy.set_ratio(percent);
        debug!(requested = percent, stored, "remote swap ratio updated");
        stored
    }

    pub fn get_rdma_swap_ratio(&self) -> u8 {
        self.policy.get_ratio()
    }

    /// Logs every valid directory entry at `info`.
    pub fn debug_print(&self) {
        let guard = self.directory.read();
        let Some(directory) = guard.as_ref() else {
            info!("[RDMA] swap tier {}", self.state());
            return;
        };
        info!(
            "[RDMA] {} of {} entries valid, ratio {}%",
            directory.len(),
            directory.capacity(),
            self.policy.get_ratio()
        );
        for entry in directory.entries() {
            info!("[RDMA] {entry}");
        }
    }

    /// Writes the same report as [`RdmaSwap::debug_print`] to `sink`.
    pub fn debug_dump(&self, sink: &mut impl fmt::Write) -> fmt::Result {
        let guard = self.directory.read();
        let Some(directory) = guard.as_ref() else {
            return writeln!(sink, "swap tier {}", self.state());
        };
        writeln!(
            sink,
            "{} of {} entries valid, ratio {}%",
            directory.len(),
            directory.capacity(),
            self.policy.get_ratio()
        )?;
        directory.dump(sink)
    }

    pub fn stats(&self) -> SwapStats {
        let guard = self.directory.read();
        let (resident, capacity) = guard
            .as_ref()
            .map(|directory| (directory.len(), directory.capacity()))
            .unwrap_or((0, 0));
        self.counters.snapshot(resident, capacity)
    }
}

impl<B: RdmaBackend> Drop for RdmaSwap<B> {
    fn drop(&mut self) {
        self.exit();
    }
}
