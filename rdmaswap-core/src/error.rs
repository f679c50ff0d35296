use rdmaswap_transfer::TransferError;
use thiserror::Error;

use crate::swap::SwapState;

pub type Result<T> = std::result::Result<T, SwapError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SwapError {
    #[error("remote page directory full ({capacity} slots)")]
    ResourceExhausted { capacity: usize },
    #[error("transport bring-up failed: {0}")]
    TransportInit(#[source] TransferError),
    #[error("page {local_id:#x} not present in the remote tier")]
    NotFound { local_id: u64 },
    #[error("page {local_id:#x} already has a store in flight")]
    StoreInFlight { local_id: u64 },
    #[error("store of page {local_id:#x} cancelled by invalidation")]
    StoreCancelled { local_id: u64 },
    #[error("remote page i/o failed: {0}")]
    Io(#[source] TransferError),
    #[error("{op} rejected: swap tier is {state}")]
    InvalidState { op: &'static str, state: SwapState },
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl SwapError {
    /// Out of directory slots or out of transport resources.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. } | Self::TransportInit(_))
    }

    /// The remote transfer itself failed or timed out.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
