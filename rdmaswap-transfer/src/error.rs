use thiserror::Error;

use crate::completion::TransferOp;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transport not initialized")]
    NotInitialized,
    #[error("transport already initialized")]
    AlreadyInitialized,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("batch length mismatch: pages={pages}, slots={slots}")]
    BatchLengthMismatch { pages: usize, slots: usize },
    #[error("rdma device not found: {0}")]
    DeviceNotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("{op} completion failed: status={status}, vendor_err={vendor_err}")]
    Completion {
        op: TransferOp,
        status: u32,
        vendor_err: u32,
    },
    #[error("{op} completion timed out after {waited_ms}ms")]
    Timeout { op: TransferOp, waited_ms: u64 },
}

impl TransferError {
    /// True for failures of a posted work request (bad completion or no
    /// completion at all), as opposed to setup or argument errors.
    pub fn is_completion_failure(&self) -> bool {
        matches!(self, Self::Completion { .. } | Self::Timeout { .. })
    }
}
