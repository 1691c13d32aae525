//! Argument encoding
//!
//! Little-endian, each scalar aligned to its size relative to the start of
//! the buffer:
//!
//! | type        | encoding                                        |
//! |-------------|-------------------------------------------------|
//! | `u32`/`i32` | 4 bytes, align 4                                |
//! | `u64`       | 8 bytes, align 8                                |
//! | bytes, str  | u32 length (align 4), then the raw bytes        |
//! | interface   | u32 presence flag, then u32 length + marshal record |
//!
//! Interface pointers go through the standard marshaler with normal
//! references, so encoding and decoding need the apartment the call runs in.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rpcrt::RpcError;
use tracing::warn;

use super::ArgType;
use crate::apartment::Apartment;
use crate::marshal::{marshal_interface, release_marshal_data, unmarshal_interface, MarshalMode};
use crate::object::Value;
use crate::types::{ComError, Result};

/// An encoded argument list plus every marshal record written into it
#[derive(Debug, Default)]
pub struct Encoded {
    pub payload: Bytes,
    /// Records handed out for interface arguments; released again if the
    /// call never reaches the other side
    pub records: Vec<Bytes>,
}

impl Encoded {
    /// Give back the references carried by the marshal records
    pub async fn release(self, apartment: &Arc<Apartment>) {
        for record in self.records {
            if let Err(e) = release_marshal_data(apartment, &record).await {
                warn!(error = %e, "failed to release marshal record");
            }
        }
    }
}

struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn align(&mut self, n: usize) {
        while self.buf.len() % n != 0 {
            self.buf.put_u8(0);
        }
    }

    fn put_u32(&mut self, v: u32) {
        self.align(4);
        self.buf.put_u32_le(v);
    }

    fn put_u64(&mut self, v: u64) {
        self.align(8);
        self.buf.put_u64_le(v);
    }

    fn put_blob(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| ComError::InvalidArgument(format!("{} byte argument", data.len())))?;
        self.put_u32(len);
        self.buf.put_slice(data);
        Ok(())
    }
}

/// Encode `values` as described by `types`
pub async fn encode_values(
    apartment: &Arc<Apartment>,
    types: &[ArgType],
    values: Vec<Value>,
) -> Result<Encoded> {
    if values.len() != types.len() {
        return Err(ComError::InvalidArgument(format!(
            "expected {} arguments, got {}",
            types.len(),
            values.len()
        )));
    }

    let mut writer = Writer { buf: BytesMut::new() };
    let mut encoded = Encoded::default();
    for (ty, value) in types.iter().zip(values) {
        if let Err(e) = encode_value(apartment, &mut writer, &mut encoded.records, *ty, value).await {
            encoded.release(apartment).await;
            return Err(e);
        }
    }
    encoded.payload = writer.buf.freeze();
    Ok(encoded)
}

async fn encode_value(
    apartment: &Arc<Apartment>,
    writer: &mut Writer,
    records: &mut Vec<Bytes>,
    ty: ArgType,
    value: Value,
) -> Result<()> {
    match (ty, value) {
        (ArgType::U32, Value::U32(v)) => writer.put_u32(v),
        (ArgType::I32, Value::I32(v)) => writer.put_u32(v as u32),
        (ArgType::U64, Value::U64(v)) => writer.put_u64(v),
        (ArgType::Bytes, Value::Bytes(v)) => writer.put_blob(&v)?,
        (ArgType::Str, Value::Str(v)) => writer.put_blob(v.as_bytes())?,
        (ArgType::Interface(_), Value::Interface(None)) => writer.put_u32(0),
        (ArgType::Interface(iid), Value::Interface(Some(ptr))) => {
            let record = marshal_interface(apartment, &ptr, iid, MarshalMode::Normal).await?;
            writer.put_u32(1);
            writer.put_blob(&record)?;
            records.push(record);
        }
        (ty, value) => {
            return Err(ComError::InvalidArgument(format!(
                "expected {:?}, got {}",
                ty,
                value.kind()
            )))
        }
    }
    Ok(())
}

struct Reader {
    buf: Bytes,
    len: usize,
}

impl Reader {
    fn offset(&self) -> usize {
        self.len - self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(RpcError::ShortRead {
                needed: n,
                have: self.buf.remaining(),
            }
            .into());
        }
        Ok(())
    }

    fn align(&mut self, n: usize) -> Result<()> {
        let pad = (n - self.offset() % n) % n;
        self.need(pad)?;
        self.buf.advance(pad);
        Ok(())
    }

    fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn get_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn get_blob(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }
}

/// Decode a payload as described by `types`. Interface pointers are
/// unmarshaled into `apartment`.
pub async fn decode_values(apartment: &Arc<Apartment>, types: &[ArgType], payload: Bytes) -> Result<Vec<Value>> {
    let mut reader = Reader {
        len: payload.len(),
        buf: payload,
    };
    let mut values = Vec::with_capacity(types.len());
    for ty in types {
        let value = match *ty {
            ArgType::U32 => Value::U32(reader.get_u32()?),
            ArgType::I32 => Value::I32(reader.get_u32()? as i32),
            ArgType::U64 => Value::U64(reader.get_u64()?),
            ArgType::Bytes => Value::Bytes(reader.get_blob()?),
            ArgType::Str => {
                let raw = reader.get_blob()?;
                let s = String::from_utf8(raw.to_vec())
                    .map_err(|_| ComError::InvalidArgument("string argument is not UTF-8".into()))?;
                Value::Str(s)
            }
            ArgType::Interface(iid) => match reader.get_u32()? {
                0 => Value::Interface(None),
                _ => {
                    let record = reader.get_blob()?;
                    Value::Interface(Some(unmarshal_interface(apartment, &record, iid).await?))
                }
            },
        };
        values.push(value);
    }
    Ok(values)
}
