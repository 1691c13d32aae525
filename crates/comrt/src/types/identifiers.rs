//! Apartment, object and interface-pointer identifiers
//!
//! - OXID: one per apartment, `(process id << 32) | counter`
//! - OID: per-apartment counter starting at 1
//! - IPID: derived from `(OXID, OID, per-object interface counter)`, so the
//!   owning apartment can be recovered from any IPID seen on the wire

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut};
use rpcrt::Uuid;

/// Apartment (object exporter) identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Oxid(pub u64);

impl Oxid {
    pub const SIZE: usize = 8;

    /// Next apartment identifier for this process
    pub fn generate() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        let pid = std::process::id() as u64;
        Self((pid << 32) | NEXT.fetch_add(1, Ordering::Relaxed) as u64)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.0);
    }

    /// Caller checks that 8 bytes remain
    pub fn decode<B: Buf>(buf: &mut B) -> Self {
        Self(buf.get_u64_le())
    }
}

impl fmt::Debug for Oxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OXID({:016x})", self.0)
    }
}

impl fmt::Display for Oxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Object identifier, unique within its apartment
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Oid(pub u64);

impl Oid {
    pub const SIZE: usize = 8;

    /// Reserved for the apartment's own IRemUnknown
    pub const REMUNKNOWN: Oid = Oid(0);

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.0);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Self {
        Self(buf.get_u64_le())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OID({:016x})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Interface pointer identifier
///
/// Byte layout (as encoded little-endian):
/// - 0..4: per-object interface counter
/// - 4..8: low 32 bits of the OID
/// - 8..16: the OXID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ipid(pub Uuid);

impl Ipid {
    pub const SIZE: usize = 16;

    pub fn derive(oxid: Oxid, oid: Oid, counter: u32) -> Self {
        let oxid = oxid.0.to_le_bytes();
        Self(Uuid {
            time_low: counter,
            time_mid: oid.0 as u16,
            time_hi_and_version: (oid.0 >> 16) as u16,
            clock_seq: [oxid[0], oxid[1]],
            node: [oxid[2], oxid[3], oxid[4], oxid[5], oxid[6], oxid[7]],
        })
    }

    /// IPID of an apartment's IRemUnknown
    pub fn remunknown(oxid: Oxid) -> Self {
        Self::derive(oxid, Oid::REMUNKNOWN, 0)
    }

    /// Apartment that issued this IPID
    pub fn oxid(&self) -> Oxid {
        let c = self.0.clock_seq;
        let n = self.0.node;
        Oxid(u64::from_le_bytes([c[0], c[1], n[0], n[1], n[2], n[3], n[4], n[5]]))
    }

    pub fn counter(&self) -> u32 {
        self.0.time_low
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf, true);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> rpcrt::Result<Self> {
        Ok(Self(Uuid::decode(buf, true)?))
    }
}

impl fmt::Debug for Ipid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPID({})", self.0)
    }
}

impl fmt::Display for Ipid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for Ipid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
