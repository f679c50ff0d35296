//! In-process stand-in for a remote peer.
//!
//! The peer's registered region is kept in a sparse page map that outlives
//! the transport context, like real remote memory outlives our queue pair.
//! Every operation goes through the same post / poll / complete cycle as the
//! verbs backend, against a simulated completion queue, so timeouts, error
//! completions and rkey checks behave the same way.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    api::{RemoteRegion, RemoteSlot, TransportConfig, PAGE_SIZE},
    backend::RdmaBackend,
    completion::{
        poll_completion, TransferOp, WorkCompletion, WC_REM_ACCESS_ERR, WC_RETRY_EXC_ERR,
        WC_SUCCESS,
    },
    error::{Result, TransferError},
};

pub const LOOPBACK_DEVICE: &str = "loopback";

/// Operation counters, useful to assert what actually hit the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackCounters {
    pub reads_posted: u64,
    pub writes_posted: u64,
    pub initializations: u64,
    pub cleanups: u64,
}

struct LoopbackContext {
    cq_depth: usize,
    cq: VecDeque<WorkCompletion>,
    staging: Box<[u8; PAGE_SIZE]>,
    next_wr_id: u64,
}

pub struct LoopbackBackend {
    device_present: bool,
    region: RemoteRegion,
    remote_pages: Mutex<HashMap<usize, Box<[u8; PAGE_SIZE]>>>,
    context: Mutex<Option<LoopbackContext>>,
    fail_reads: AtomicUsize,
    fail_writes: AtomicUsize,
    stall: AtomicBool,
    reads_posted: AtomicU64,
    writes_posted: AtomicU64,
    initializations: AtomicU64,
    cleanups: AtomicU64,
}

impl LoopbackBackend {
    pub fn new(region: RemoteRegion) -> Self {
        Self {
            device_present: true,
            region,
            remote_pages: Mutex::new(HashMap::new()),
            context: Mutex::new(None),
            fail_reads: AtomicUsize::new(0),
            fail_writes: AtomicUsize::new(0),
            stall: AtomicBool::new(false),
            reads_posted: AtomicU64::new(0),
            writes_posted: AtomicU64::new(0),
            initializations: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
        }
    }

    /// A host with no RDMA device: `initialize` always fails.
    pub fn without_device(region: RemoteRegion) -> Self {
        Self {
            device_present: false,
            ..Self::new(region)
        }
    }

    pub fn region(&self) -> RemoteRegion {
        self.region
    }

    /// The next `count` reads complete with a retry-exceeded status.
    pub fn fail_reads(&self, count: usize) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    /// The next `count` writes complete with a retry-exceeded status.
    pub fn fail_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// While set, posted work requests never complete.
    pub fn stall_completions(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    pub fn counters(&self) -> LoopbackCounters {
        LoopbackCounters {
            reads_posted: self.reads_posted.load(Ordering::SeqCst),
            writes_posted: self.writes_posted.load(Ordering::SeqCst),
            initializations: self.initializations.load(Ordering::SeqCst),
            cleanups: self.cleanups.load(Ordering::SeqCst),
        }
    }

    /// Number of remote pages that have been written at least once.
    pub fn remote_pages_written(&self) -> usize {
        self.remote_pages.lock().len()
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    /// Executes the one-sided access against the peer region and returns the
    /// completion status the peer's HCA would report.
    fn execute(&self, op: TransferOp, staging: &mut [u8; PAGE_SIZE], remote: RemoteSlot) -> u32 {
        let injected = match op {
            TransferOp::Read => Self::take_injected(&self.fail_reads),
            TransferOp::Write => Self::take_injected(&self.fail_writes),
        };
        if injected {
            return WC_RETRY_EXC_ERR;
        }
        if remote.rkey != self.region.rkey {
            return WC_REM_ACCESS_ERR;
        }
        let Some(page_index) = self.region.page_index(remote.addr) else {
            return WC_REM_ACCESS_ERR;
        };

        let mut pages = self.remote_pages.lock();
        match op {
            TransferOp::Read => match pages.get(&page_index) {
                Some(page) => staging.copy_from_slice(&page[..]),
                None => staging.fill(0),
            },
            TransferOp::Write => {
                pages
                    .entry(page_index)
                    .or_insert_with(|| Box::new([0_u8; PAGE_SIZE]))
                    .copy_from_slice(&staging[..]);
            }
        }
        WC_SUCCESS
    }

    fn post_and_wait(
        &self,
        ctx: &mut LoopbackContext,
        op: TransferOp,
        remote: RemoteSlot,
        timeout: Duration,
    ) -> Result<()> {
        if ctx.cq.len() >= ctx.cq_depth {
            return Err(TransferError::Backend(
                "completion queue overrun".to_string(),
            ));
        }

        let wr_id = ctx.next_wr_id;
        ctx.next_wr_id = ctx.next_wr_id.wrapping_add(1);
        match op {
            TransferOp::Read => self.reads_posted.fetch_add(1, Ordering::SeqCst),
            TransferOp::Write => self.writes_posted.fetch_add(1, Ordering::SeqCst),
        };

        if !self.stall.load(Ordering::SeqCst) {
            let status = self.execute(op, &mut ctx.staging, remote);
            ctx.cq.push_back(WorkCompletion::new(wr_id, status));
        }

        let cq = &mut ctx.cq;
        let outcome = poll_completion(wr_id, timeout, || Ok(cq.pop_front()))?;
        debug!(wr_id, ?op, ?outcome, addr = remote.addr, "loopback work request finished");
        outcome.into_result(op, timeout)
    }
}

impl RdmaBackend for LoopbackBackend {
    fn initialize(&self, config: TransportConfig) -> Result<()> {
        if !self.device_present {
            return Err(TransferError::DeviceNotFound(
                config.nic_name.unwrap_or_else(|| "any".to_string()),
            ));
        }
        if let Some(name) = config.nic_name.as_deref() {
            if name != LOOPBACK_DEVICE {
                return Err(TransferError::DeviceNotFound(name.to_string()));
            }
        }
        if config.cq_depth == 0 {
            return Err(TransferError::InvalidArgument("cq_depth must be non-zero"));
        }

        let mut guard = self.context.lock();
        if guard.is_some() {
            return Err(TransferError::AlreadyInitialized);
        }
        *guard = Some(LoopbackContext {
            cq_depth: config.cq_depth as usize,
            cq: VecDeque::with_capacity(config.cq_depth as usize),
            staging: Box::new([0_u8; PAGE_SIZE]),
            next_wr_id: 1,
        });
        self.initializations.fetch_add(1, Ordering::SeqCst);
        info!(
            cq_depth = config.cq_depth,
            pages = self.region.page_count(),
            "loopback transport initialized, remote base {:#x}",
            self.region.base_addr
        );
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.context.lock().is_some()
    }

    fn read_page(
        &self,
        dst: &mut [u8; PAGE_SIZE],
        remote: RemoteSlot,
        timeout: Duration,
    ) -> Result<()> {
        let mut guard = self.context.lock();
        let ctx = guard.as_mut().ok_or(TransferError::NotInitialized)?;
        self.post_and_wait(ctx, TransferOp::Read, remote, timeout)?;
        dst.copy_from_slice(&ctx.staging[..]);
        Ok(())
    }

    fn write_page(&self, src: &[u8; PAGE_SIZE], remote: RemoteSlot, timeout: Duration) -> Result<()> {
        let mut guard = self.context.lock();
        let ctx = guard.as_mut().ok_or(TransferError::NotInitialized)?;
        ctx.staging.copy_from_slice(&src[..]);
        self.post_and_wait(ctx, TransferOp::Write, remote, timeout)
    }

    fn cleanup(&self) {
        if self.context.lock().take().is_some() {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            info!("loopback transport context destroyed");
        }
    }
}
