// ============================================================================
// rdmaswap-core: a remote swap tier for page-granular memory.
//
// Pages evicted from local memory are written with one-sided RDMA WRITEs into
// a memory region registered by a peer, and read back with RDMA READs on
// page-in. The pieces:
// - `directory`: fixed-capacity table mapping local page ids to remote slots.
// - `index`: pluggable slot lookup (linear scan or hashed).
// - `policy`: the advisory remote-tier ratio and the enabled switch.
// - `swap`: `RdmaSwap`, the lifecycle-guarded facade the page-I/O path calls.
// Transport lives in `rdmaswap-transfer`; this crate is generic over its
// `RdmaBackend` trait and tests against the loopback backend.
// ============================================================================

pub mod config;
pub mod directory;
pub mod error;
pub mod index;
pub mod page;
pub mod policy;
pub mod stats;
pub mod swap;

pub use config::{IndexKind, SwapConfig, DEFAULT_CAPACITY, DEFAULT_RATIO};
pub use directory::{DirectoryEntry, EntryState, RemotePageDirectory, RemotePageEntry};
pub use error::{Result, SwapError};
pub use index::{HashedIndex, LinearScan, SlotIndex};
pub use page::Page;
pub use policy::SwapPolicy;
pub use stats::SwapStats;
pub use swap::{RdmaSwap, SwapState};

pub use rdmaswap_transfer::{PAGE_SIZE, RemoteRegion, TransportConfig};
