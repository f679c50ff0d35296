use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Remote-tier share of swap traffic plus the on/off switch driven by the
/// swap lifecycle. Advisory: nothing here routes pages by itself.
#[derive(Debug)]
pub struct SwapPolicy {
    ratio: AtomicU8,
    enabled: AtomicBool,
}

impl SwapPolicy {
    pub fn new(initial_ratio: u8) -> Self {
        Self {
            ratio: AtomicU8::new(initial_ratio.min(100)),
            enabled: AtomicBool::new(false),
        }
    }

    /// Stores `percent` clamped to 0..=100 and returns the stored value.
    pub fn set_ratio(&self, percent: i32) -> u8 {
        let clamped = percent.clamp(0, 100) as u8;
        self.ratio.store(clamped, Ordering::Relaxed);
        clamped
    }

    pub fn get_ratio(&self) -> u8 {
        self.ratio.load(Ordering::Relaxed)
    }

    pub fn use_remote_swap(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

impl Default for SwapPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RATIO)
    }
}
