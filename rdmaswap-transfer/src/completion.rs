//! Bounded completion-queue polling shared by every backend.
//!
//! A posted work request is waited for by polling the completion queue one
//! entry at a time until the matching `wr_id` shows up or the deadline passes.
//! Completions carrying another `wr_id` belong to requests that already timed
//! out and are discarded.

use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use crate::error::{Result, TransferError};

/// `IBV_WC_SUCCESS`.
pub(crate) const WC_SUCCESS: u32 = 0;
/// `IBV_WC_REM_ACCESS_ERR`: rkey or bounds rejected by the remote side.
pub(crate) const WC_REM_ACCESS_ERR: u32 = 10;
/// `IBV_WC_RETRY_EXC_ERR`: transport retries exhausted.
pub(crate) const WC_RETRY_EXC_ERR: u32 = 12;

const SPIN_POLLS: u32 = 64;
const POLL_BACKOFF: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOp {
    Read,
    Write,
}

impl fmt::Display for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOp::Read => f.write_str("rdma read"),
            TransferOp::Write => f.write_str("rdma write"),
        }
    }
}

/// Result of waiting for one work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success,
    Timeout,
    Error { status: u32, vendor_err: u32 },
}

impl CompletionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionOutcome::Success)
    }

    pub(crate) fn into_result(self, op: TransferOp, timeout: Duration) -> Result<()> {
        match self {
            CompletionOutcome::Success => Ok(()),
            CompletionOutcome::Timeout => Err(TransferError::Timeout {
                op,
                waited_ms: timeout.as_millis() as u64,
            }),
            CompletionOutcome::Error { status, vendor_err } => Err(TransferError::Completion {
                op,
                status,
                vendor_err,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkCompletion {
    pub(crate) wr_id: u64,
    pub(crate) status: u32,
    pub(crate) vendor_err: u32,
}

impl WorkCompletion {
    pub(crate) fn new(wr_id: u64, status: u32) -> Self {
        Self {
            wr_id,
            status,
            vendor_err: 0,
        }
    }
}

/// Polls with `poll` until the completion for `wr_id` arrives or `timeout`
/// elapses. `poll` returns at most one completion per call.
pub(crate) fn poll_completion<F>(wr_id: u64, timeout: Duration, mut poll: F) -> Result<CompletionOutcome>
where
    F: FnMut() -> Result<Option<WorkCompletion>>,
{
    let deadline = Instant::now() + timeout;
    let mut polls = 0_u32;
    loop {
        while let Some(wc) = poll()? {
            if wc.wr_id != wr_id {
                tracing::debug!(
                    expected = wr_id,
                    got = wc.wr_id,
                    status = wc.status,
                    "discarding stale completion"
                );
                continue;
            }
            if wc.status != WC_SUCCESS {
                return Ok(CompletionOutcome::Error {
                    status: wc.status,
                    vendor_err: wc.vendor_err,
                });
            }
            return Ok(CompletionOutcome::Success);
        }

        if Instant::now() >= deadline {
            return Ok(CompletionOutcome::Timeout);
        }
        polls = polls.saturating_add(1);
        if polls < SPIN_POLLS {
            std::hint::spin_loop();
        } else {
            thread::sleep(POLL_BACKOFF);
        }
    }
}
