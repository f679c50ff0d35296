use std::fmt;

use rdmaswap_transfer::PAGE_SIZE;

/// An owned page frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Page(Box<[u8; PAGE_SIZE]>);

impl Page {
    pub fn zeroed() -> Self {
        Self(Box::new([0_u8; PAGE_SIZE]))
    }

    pub fn filled(byte: u8) -> Self {
        Self(Box::new([byte; PAGE_SIZE]))
    }

    /// Copies `bytes` into a new frame. `None` unless exactly one page long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PAGE_SIZE {
            return None;
        }
        let mut page = Self::zeroed();
        page.0.copy_from_slice(bytes);
        Some(page)
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("head", &&self.0[..8])
            .finish_non_exhaustive()
    }
}
