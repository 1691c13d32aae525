//! Marshal record: the wire form of a marshaled interface pointer
//!
//! ```text
//!  0  flags        u32   bit0 table-strong, bit1 no-ping
//!  4  public_refs  u32
//!  8  oxid         u64
//! 16  oid          u64
//! 24  ipid         16 bytes
//! 40  iid          16 bytes
//! 56  bindings     dual string array
//! ```
//!
//! All fields are little-endian. The first 40 bytes are the [`StdObjRef`]
//! that RemQueryInterface also returns; the IID tells the importer which
//! interface the IPID belongs to.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rpcrt::Uuid;

use super::error::{ComError, Result};
use super::identifiers::{Ipid, Oid, Oxid};
use super::stringbinding::DualStringArray;

/// Marshal record flags
pub mod flags {
    /// The exporter holds an extra reference until the record is released
    pub const TABLE_STRONG: u32 = 0x0000_0001;
    /// The importer does not need to ping the exporter
    pub const NO_PING: u32 = 0x0000_0002;
}

/// Fixed part of a marshal record; also returned by RemQueryInterface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StdObjRef {
    pub flags: u32,
    pub public_refs: u32,
    pub oxid: Oxid,
    pub oid: Oid,
    pub ipid: Ipid,
}

impl StdObjRef {
    /// 4 + 4 + 8 + 8 + 16
    pub const SIZE: usize = 40;

    pub fn new(oxid: Oxid, oid: Oid, ipid: Ipid, public_refs: u32) -> Self {
        Self {
            flags: flags::NO_PING,
            public_refs,
            oxid,
            oid,
            ipid,
        }
    }

    pub fn is_table_strong(&self) -> bool {
        self.flags & flags::TABLE_STRONG != 0
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.public_refs);
        self.oxid.encode(buf);
        self.oid.encode(buf);
        self.ipid.encode(buf);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(ComError::InvalidObjRef(format!(
                "record header: need {} bytes, have {}",
                Self::SIZE,
                buf.remaining()
            )));
        }
        let flags = buf.get_u32_le();
        let public_refs = buf.get_u32_le();
        let oxid = Oxid::decode(buf);
        let oid = Oid::decode(buf);
        let ipid = Ipid::decode(buf).map_err(|e| ComError::InvalidObjRef(e.to_string()))?;
        Ok(Self {
            flags,
            public_refs,
            oxid,
            oid,
            ipid,
        })
    }
}

/// Complete marshal record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjRef {
    pub std: StdObjRef,
    /// Interface the record was marshaled for
    pub iid: Uuid,
    pub bindings: DualStringArray,
}

impl ObjRef {
    pub fn encoded_size(&self) -> usize {
        StdObjRef::SIZE + Uuid::SIZE + self.bindings.encoded_size()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.std.encode(buf);
        self.iid.encode(buf, true);
        self.bindings.encode(buf);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let std = StdObjRef::decode(buf)?;
        let iid = Uuid::decode(buf, true).map_err(|e| ComError::InvalidObjRef(e.to_string()))?;
        let bindings = DualStringArray::decode(buf)?;
        Ok(Self { std, iid, bindings })
    }
}
