//! Common test utilities for rdmaswap-core tests.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rdmaswap_core::{IndexKind, Page, RdmaSwap, SwapConfig, PAGE_SIZE};
use rdmaswap_transfer::{LoopbackBackend, RdmaBackend, RemoteSlot, TransferOp, TransportConfig};

/// Completion timeout used by every test tier; short so stall tests finish fast.
pub const TEST_TIMEOUT: Duration = Duration::from_millis(50);

/// Both directory index strategies, for running a scenario under each.
pub const INDEX_KINDS: [IndexKind; 2] = [IndexKind::Linear, IndexKind::Hashed];

/// Upper bound on waiting for a held operation to arrive at the gate.
const GATE_WAIT: Duration = Duration::from_secs(5);

/// Generate a deterministic page from an id (for reproducible tests).
pub fn page_for(local_id: u64) -> Page {
    let mut page = Page::zeroed();
    let stamp = local_id.to_le_bytes();
    for (offset, byte) in page.as_bytes_mut().iter_mut().enumerate() {
        *byte = stamp[offset % stamp.len()] ^ (offset / stamp.len()) as u8;
    }
    page
}

pub fn test_config(capacity: usize, index: IndexKind) -> SwapConfig {
    SwapConfig::default()
        .with_capacity(capacity)
        .with_index(index)
        .with_completion_timeout(TEST_TIMEOUT)
}

/// A swap tier over a loopback peer, not yet initialized.
pub fn loopback_swap(capacity: usize, index: IndexKind) -> RdmaSwap<LoopbackBackend> {
    let config = test_config(capacity, index);
    let backend = LoopbackBackend::new(config.remote_region());
    RdmaSwap::new(config, backend).expect("valid test config")
}

/// A swap tier over a loopback peer, initialized.
pub fn ready_swap(capacity: usize, index: IndexKind) -> RdmaSwap<LoopbackBackend> {
    let swap = loopback_swap(capacity, index);
    swap.init().expect("init should succeed");
    swap
}

/// A swap tier over a gated loopback peer, initialized.
pub fn gated_swap(capacity: usize, index: IndexKind) -> RdmaSwap<GatedBackend> {
    let config = test_config(capacity, index);
    let backend = GatedBackend::new(LoopbackBackend::new(config.remote_region()));
    let swap = RdmaSwap::new(config, backend).expect("valid test config");
    swap.init().expect("init should succeed");
    swap
}

pub fn assert_page_eq(actual: &Page, expected: &Page) {
    assert_eq!(actual.as_bytes().len(), PAGE_SIZE);
    assert!(actual == expected, "page contents differ");
}

#[derive(Default)]
struct Gate {
    armed: Option<TransferOp>,
    parked: bool,
    open: bool,
}

/// Loopback peer that can hold one operation before it reaches the queue
/// pair, so a test can act while that operation is in flight.
pub struct GatedBackend {
    inner: LoopbackBackend,
    gate: Mutex<Gate>,
    changed: Condvar,
}

impl GatedBackend {
    pub fn new(inner: LoopbackBackend) -> Self {
        Self {
            inner,
            gate: Mutex::new(Gate::default()),
            changed: Condvar::new(),
        }
    }

    pub fn loopback(&self) -> &LoopbackBackend {
        &self.inner
    }

    /// The next `op` blocks until [`GatedBackend::release`].
    pub fn hold_next(&self, op: TransferOp) {
        let mut gate = self.gate.lock();
        *gate = Gate {
            armed: Some(op),
            ..Gate::default()
        };
    }

    /// Blocks until the held operation has arrived at the gate.
    pub fn wait_parked(&self) {
        let deadline = Instant::now() + GATE_WAIT;
        let mut gate = self.gate.lock();
        while !gate.parked {
            if self.changed.wait_until(&mut gate, deadline).timed_out() {
                panic!("held operation never arrived");
            }
        }
    }

    /// Lets the held operation continue to the peer.
    pub fn release(&self) {
        self.gate.lock().open = true;
        self.changed.notify_all();
    }

    fn pass(&self, op: TransferOp) {
        let mut gate = self.gate.lock();
        if gate.armed != Some(op) {
            return;
        }
        gate.armed = None;
        gate.parked = true;
        self.changed.notify_all();
        while !gate.open {
            self.changed.wait(&mut gate);
        }
    }
}

impl RdmaBackend for GatedBackend {
    fn initialize(&self, config: TransportConfig) -> rdmaswap_transfer::Result<()> {
        self.inner.initialize(config)
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    fn read_page(
        &self,
        dst: &mut [u8; PAGE_SIZE],
        remote: RemoteSlot,
        timeout: Duration,
    ) -> rdmaswap_transfer::Result<()> {
        self.pass(TransferOp::Read);
        self.inner.read_page(dst, remote, timeout)
    }

    fn write_page(
        &self,
        src: &[u8; PAGE_SIZE],
        remote: RemoteSlot,
        timeout: Duration,
    ) -> rdmaswap_transfer::Result<()> {
        self.pass(TransferOp::Write);
        self.inner.write_page(src, remote, timeout)
    }

    fn cleanup(&self) {
        self.inner.cleanup()
    }
}
