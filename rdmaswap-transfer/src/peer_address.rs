use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use bytes::Bytes;

use crate::error::TransferError;

/// Reliable-connected endpoint of the remote peer: GID, LID, QP number and
/// initial packet sequence number.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress(Bytes);

impl PeerAddress {
    pub const BYTES: usize = 26;

    pub fn from_parts(gid: [u8; 16], lid: u16, qp_num: u32, psn: u32) -> Self {
        let mut bytes = [0_u8; Self::BYTES];
        bytes[..16].copy_from_slice(&gid);
        bytes[16..18].copy_from_slice(&lid.to_le_bytes());
        bytes[18..22].copy_from_slice(&qp_num.to_le_bytes());
        bytes[22..26].copy_from_slice(&psn.to_le_bytes());
        Self(Bytes::copy_from_slice(&bytes))
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::BYTES {
            return None;
        }
        Some(Self(Bytes::copy_from_slice(bytes)))
    }

    pub fn to_hex(&self) -> String {
        bytes_to_hex(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        Self::from_bytes(&hex_to_bytes(s)?)
    }

    pub fn gid(&self) -> [u8; 16] {
        let mut gid = [0_u8; 16];
        gid.copy_from_slice(&self.0[..16]);
        gid
    }

    pub fn lid(&self) -> u16 {
        u16::from_le_bytes([self.0[16], self.0[17]])
    }

    pub fn qp_num(&self) -> u32 {
        u32::from_le_bytes([self.0[18], self.0[19], self.0[20], self.0[21]])
    }

    pub fn psn(&self) -> u32 {
        u32::from_le_bytes([self.0[22], self.0[23], self.0[24], self.0[25]])
    }
}

impl FromStr for PeerAddress {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim()).ok_or(TransferError::InvalidArgument(
            "peer address is not a valid 26-byte hex string",
        ))
    }
}

impl std::fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PeerAddress {{ gid: {:?}, lid: {}, qp_num: {}, psn: {} }}",
            self.gid(),
            self.lid(),
            self.qp_num(),
            self.psn()
        )
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PeerAddress(lid={}, qp_num={}, psn={})",
            self.lid(),
            self.qp_num(),
            self.psn()
        )
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_to_bytes(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    let chars = s.as_bytes();
    let mut out = Vec::with_capacity(s.len() / 2);
    for pair in chars.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)? as u8;
        let lo = (pair[1] as char).to_digit(16)? as u8;
        out.push((hi << 4) | lo);
    }
    Some(out)
}
