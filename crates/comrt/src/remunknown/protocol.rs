//! IRemUnknown wire format
//!
//! Every apartment serves IRemUnknown on the object UUID
//! [`Ipid::remunknown`] of its OXID. All fields are little-endian.
//!
//! ```text
//! RemQueryInterface  ipid, public_refs u32, count u32, iid[count]
//!                 -> count u32, { hresult u32, StdObjRef if hresult is S_OK }[count]
//! RemAddRef          count u32, { ipid, public u32, private u32 }[count]
//!                 -> count u32, hresult[count]
//! RemRelease         count u32, { ipid, public u32, private u32 }[count]
//!                 -> (empty)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rpcrt::{RpcError, SyntaxId};

use crate::types::{hresult, iid, Iid, Ipid, Result, StdObjRef};

/// IRemUnknown interface syntax
pub const REMUNKNOWN_SYNTAX: SyntaxId = SyntaxId::new(iid::IREMUNKNOWN, 0, 0);

/// Operation numbers
pub mod opnum {
    pub const REM_QUERY_INTERFACE: u16 = 3;
    pub const REM_ADD_REF: u16 = 4;
    pub const REM_RELEASE: u16 = 5;
}

fn need<B: Buf>(buf: &B, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(RpcError::ShortRead {
            needed: n,
            have: buf.remaining(),
        }
        .into());
    }
    Ok(())
}

/// Read an element count and check the buffer can hold that many
/// `elem_size`-byte elements
fn get_count<B: Buf>(buf: &mut B, elem_size: usize) -> Result<usize> {
    need(buf, 4)?;
    let count = buf.get_u32_le() as usize;
    need(buf, count.saturating_mul(elem_size))?;
    Ok(count)
}

/// One entry of a RemAddRef or RemRelease batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemInterfaceRef {
    pub ipid: Ipid,
    pub public_refs: u32,
    pub private_refs: u32,
}

impl RemInterfaceRef {
    pub const SIZE: usize = Ipid::SIZE + 4 + 4;

    pub fn new(ipid: Ipid, public_refs: u32) -> Self {
        Self {
            ipid,
            public_refs,
            private_refs: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.public_refs.saturating_add(self.private_refs)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.ipid.encode(buf);
        buf.put_u32_le(self.public_refs);
        buf.put_u32_le(self.private_refs);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        need(buf, Self::SIZE)?;
        Ok(Self {
            ipid: Ipid::decode(buf)?,
            public_refs: buf.get_u32_le(),
            private_refs: buf.get_u32_le(),
        })
    }
}

/// Encode a RemAddRef or RemRelease request
pub fn encode_refs(refs: &[RemInterfaceRef]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + refs.len() * RemInterfaceRef::SIZE);
    buf.put_u32_le(refs.len() as u32);
    for r in refs {
        r.encode(&mut buf);
    }
    buf.freeze()
}

pub fn decode_refs<B: Buf>(buf: &mut B) -> Result<Vec<RemInterfaceRef>> {
    let count = get_count(buf, RemInterfaceRef::SIZE)?;
    (0..count).map(|_| RemInterfaceRef::decode(buf)).collect()
}

/// RemQueryInterface request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemQiRequest {
    /// Any IPID of the object being queried
    pub ipid: Ipid,
    /// References requested on each returned interface
    pub public_refs: u32,
    pub iids: Vec<Iid>,
}

impl RemQiRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Ipid::SIZE + 8 + self.iids.len() * 16);
        self.ipid.encode(&mut buf);
        buf.put_u32_le(self.public_refs);
        buf.put_u32_le(self.iids.len() as u32);
        for iid in &self.iids {
            iid.encode(&mut buf, true);
        }
        buf.freeze()
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        need(buf, Ipid::SIZE + 4)?;
        let ipid = Ipid::decode(buf)?;
        let public_refs = buf.get_u32_le();
        let count = get_count(buf, 16)?;
        let iids = (0..count)
            .map(|_| Iid::decode(buf, true))
            .collect::<rpcrt::Result<Vec<_>>>()?;
        Ok(Self {
            ipid,
            public_refs,
            iids,
        })
    }
}

/// Outcome of one IID in a RemQueryInterface batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemQiResult {
    pub hresult: u32,
    pub std: Option<StdObjRef>,
}

impl RemQiResult {
    pub fn success(std: StdObjRef) -> Self {
        Self {
            hresult: hresult::S_OK,
            std: Some(std),
        }
    }

    pub fn failure(hresult: u32) -> Self {
        Self { hresult, std: None }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.hresult);
        if let (hresult::S_OK, Some(std)) = (self.hresult, &self.std) {
            std.encode(buf);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        need(buf, 4)?;
        let hresult = buf.get_u32_le();
        let std = if hresult == hresult::S_OK {
            Some(StdObjRef::decode(buf)?)
        } else {
            None
        };
        Ok(Self { hresult, std })
    }
}

pub fn encode_qi_results(results: &[RemQiResult]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + results.len() * (4 + StdObjRef::SIZE));
    buf.put_u32_le(results.len() as u32);
    for r in results {
        r.encode(&mut buf);
    }
    buf.freeze()
}

pub fn decode_qi_results<B: Buf>(buf: &mut B) -> Result<Vec<RemQiResult>> {
    let count = get_count(buf, 4)?;
    (0..count).map(|_| RemQiResult::decode(buf)).collect()
}

pub fn encode_hresults(results: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + results.len() * 4);
    buf.put_u32_le(results.len() as u32);
    for hr in results {
        buf.put_u32_le(*hr);
    }
    buf.freeze()
}

pub fn decode_hresults<B: Buf>(buf: &mut B) -> Result<Vec<u32>> {
    let count = get_count(buf, 4)?;
    Ok((0..count).map(|_| buf.get_u32_le()).collect())
}
