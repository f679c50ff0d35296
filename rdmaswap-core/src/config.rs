use std::{fmt, time::Duration};

use rdmaswap_transfer::{RemoteRegion, TransportConfig, DEFAULT_COMPLETION_TIMEOUT};

use crate::error::{Result, SwapError};

/// Number of directory slots when not configured.
pub const DEFAULT_CAPACITY: usize = 65536;

/// Remote-tier share of swap traffic when not configured, in percent.
pub const DEFAULT_RATIO: u8 = 50;

/// Lookup structure backing the page directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Scan the slot table on every lookup.
    #[default]
    Linear,
    /// Hash map from local id to slot plus an ordered free list.
    Hashed,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Linear => f.write_str("linear"),
            IndexKind::Hashed => f.write_str("hashed"),
        }
    }
}

/// Configuration of one swap tier instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapConfig {
    /// Number of directory slots, a hard upper bound on resident pages.
    pub capacity: usize,
    /// Remote region the slots map onto. A placeholder region sized to
    /// `capacity` is used when `None`.
    pub region: Option<RemoteRegion>,
    pub index: IndexKind,
    pub initial_ratio: u8,
    /// Upper bound on a single completion wait.
    pub completion_timeout: Duration,
    pub transport: TransportConfig,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            region: None,
            index: IndexKind::default(),
            initial_ratio: DEFAULT_RATIO,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            transport: TransportConfig::default(),
        }
    }
}

impl SwapConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_region(mut self, region: RemoteRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_index(mut self, index: IndexKind) -> Self {
        self.index = index;
        self
    }

    /// Values above 100 are clamped.
    pub fn with_initial_ratio(mut self, ratio: u8) -> Self {
        self.initial_ratio = ratio.min(100);
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn remote_region(&self) -> RemoteRegion {
        self.region
            .unwrap_or_else(|| RemoteRegion::placeholder(self.capacity))
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(SwapError::InvalidConfig("capacity must be non-zero"));
        }
        if self.remote_region().page_count() < self.capacity {
            return Err(SwapError::InvalidConfig(
                "remote region smaller than directory capacity",
            ));
        }
        if self.completion_timeout.is_zero() {
            return Err(SwapError::InvalidConfig(
                "completion timeout must be non-zero",
            ));
        }
        if self.transport.cq_depth == 0 {
            return Err(SwapError::InvalidConfig("cq_depth must be non-zero"));
        }
        Ok(())
    }
}
