mod api;
mod backend;
mod completion;
mod engine;
mod error;
mod logging;
mod loopback_backend;
mod peer_address;
#[cfg(feature = "rdma")]
mod sideway_backend;

pub use api::{
    RemoteRegion, RemoteSlot, TransportConfig, DEFAULT_COMPLETION_TIMEOUT, DEFAULT_CQ_DEPTH,
    PAGE_SIZE,
};
pub use backend::RdmaBackend;
pub use completion::{CompletionOutcome, TransferOp};
pub use engine::TransferEngine;
pub use error::{Result, TransferError};
pub use loopback_backend::{LoopbackBackend, LoopbackCounters, LOOPBACK_DEVICE};
pub use peer_address::PeerAddress;
#[cfg(feature = "rdma")]
pub use sideway_backend::SidewayBackend;

/// Installs the process-wide `tracing` subscriber, honoring `RUST_LOG`.
pub fn init_logging() {
    logging::ensure_initialized(None);
}

/// Like [`init_logging`] but with explicit filter directives.
pub fn init_logging_with(filter: &str) {
    logging::ensure_initialized(Some(filter));
}
