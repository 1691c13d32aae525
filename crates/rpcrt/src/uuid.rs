//! UUIDs in DCE field layout
//!
//! The first three fields of a DCE UUID follow the byte order selected by the
//! packet's data representation; the last eight bytes are always sent as-is.

use bytes::{Buf, BufMut};

use crate::error::{Result, RpcError};

/// A DCE UUID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq: [u8; 2],
    pub node: [u8; 6],
}

impl Uuid {
    /// Encoded size in bytes
    pub const SIZE: usize = 16;

    pub const NIL: Self = Self::from_u128(0);

    /// Build a UUID from its canonical 128-bit value, so that
    /// `0x12345678_9abc_def0_1122_334455667788` reads as
    /// `12345678-9abc-def0-1122-334455667788`.
    pub const fn from_u128(v: u128) -> Self {
        let b = v.to_be_bytes();
        Self {
            time_low: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            time_mid: u16::from_be_bytes([b[4], b[5]]),
            time_hi_and_version: u16::from_be_bytes([b[6], b[7]]),
            clock_seq: [b[8], b[9]],
            node: [b[10], b[11], b[12], b[13], b[14], b[15]],
        }
    }

    /// Generate a random (version 4) UUID
    pub fn generate() -> Self {
        Self::from_u128(::uuid::Uuid::new_v4().as_u128())
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Parse the "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx" form
    pub fn parse(s: &str) -> Option<Self> {
        ::uuid::Uuid::parse_str(s.trim())
            .ok()
            .map(|u| Self::from_u128(u.as_u128()))
    }

    /// Encode in wire format
    pub fn encode<B: BufMut>(&self, buf: &mut B, little_endian: bool) {
        if little_endian {
            buf.put_u32_le(self.time_low);
            buf.put_u16_le(self.time_mid);
            buf.put_u16_le(self.time_hi_and_version);
        } else {
            buf.put_u32(self.time_low);
            buf.put_u16(self.time_mid);
            buf.put_u16(self.time_hi_and_version);
        }
        buf.put_slice(&self.clock_seq);
        buf.put_slice(&self.node);
    }

    /// Decode from wire format
    pub fn decode<B: Buf>(buf: &mut B, little_endian: bool) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(RpcError::ShortRead {
                needed: Self::SIZE,
                have: buf.remaining(),
            });
        }
        let (time_low, time_mid, time_hi_and_version) = if little_endian {
            (buf.get_u32_le(), buf.get_u16_le(), buf.get_u16_le())
        } else {
            (buf.get_u32(), buf.get_u16(), buf.get_u16())
        };
        let mut clock_seq = [0u8; 2];
        buf.copy_to_slice(&mut clock_seq);
        let mut node = [0u8; 6];
        buf.copy_to_slice(&mut node);
        Ok(Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq,
            node,
        })
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.time_low,
            self.time_mid,
            self.time_hi_and_version,
            self.clock_seq[0],
            self.clock_seq[1]
        )?;
        for b in &self.node {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

/// Interface identifier plus version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32,
}

impl SyntaxId {
    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: ((minor as u32) << 16) | major as u32,
        }
    }

    pub fn major(&self) -> u16 {
        self.version as u16
    }

    pub fn minor(&self) -> u16 {
        (self.version >> 16) as u16
    }
}

impl std::fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}.{}", self.uuid, self.major(), self.minor())
    }
}
