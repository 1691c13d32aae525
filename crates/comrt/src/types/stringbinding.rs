//! Binding strings carried in marshal records
//!
//! A dual string array lists every transport an apartment can be reached on.
//! Each entry is a tower id plus a null-terminated UTF-16 `netaddr[endpoint]`
//! string; the list ends with an empty entry and is followed by an (always
//! empty) security binding list.

use std::fmt;

use bytes::{Buf, BufMut};
use rpcrt::{protseq, tower_id};

use super::error::{ComError, Result};

/// One reachable transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StringBinding {
    pub tower_id: u16,
    /// `netaddr[endpoint]`
    pub network_addr: String,
}

impl StringBinding {
    pub fn new(tower_id: u16, network_addr: &str, endpoint: &str) -> Self {
        Self {
            tower_id,
            network_addr: format!("{}[{}]", network_addr, endpoint),
        }
    }

    /// Protocol sequence name for the tower id, if this runtime knows it
    pub fn protseq(&self) -> Option<&'static str> {
        match self.tower_id {
            tower_id::NCALRPC => Some(protseq::NCALRPC),
            tower_id::NCACN_IP_TCP => Some(protseq::NCACN_IP_TCP),
            _ => None,
        }
    }

    /// Split into (network address, endpoint)
    pub fn address(&self) -> (&str, &str) {
        let open = self.network_addr.find('[');
        let close = self.network_addr.rfind(']');
        match (open, close) {
            (Some(open), Some(close)) if close > open && close == self.network_addr.len() - 1 => (
                &self.network_addr[..open],
                &self.network_addr[open + 1..close],
            ),
            _ => (self.network_addr.as_str(), ""),
        }
    }

    /// Encoded size in u16 units
    fn units(&self) -> usize {
        1 + self.network_addr.encode_utf16().count() + 1
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.tower_id);
        for ch in self.network_addr.encode_utf16() {
            buf.put_u16_le(ch);
        }
        buf.put_u16_le(0);
    }
}

impl fmt::Display for StringBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protseq() {
            Some(p) => write!(f, "{}:{}", p, self.network_addr),
            None => write!(f, "tower{:#x}:{}", self.tower_id, self.network_addr),
        }
    }
}

/// Every transport an apartment is reachable on
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DualStringArray {
    pub string_bindings: Vec<StringBinding>,
}

impl DualStringArray {
    /// num_entries + security_offset
    pub const HEADER_SIZE: usize = 4;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_string_binding(&mut self, binding: StringBinding) {
        self.string_bindings.push(binding);
    }

    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.total_units() * 2
    }

    fn string_units(&self) -> usize {
        self.string_bindings.iter().map(StringBinding::units).sum::<usize>() + 1
    }

    fn total_units(&self) -> usize {
        // string list, its terminator, then the empty security list terminator
        self.string_units() + 1
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.total_units() as u16);
        buf.put_u16_le(self.string_units() as u16);
        for sb in &self.string_bindings {
            sb.encode(buf);
        }
        buf.put_u16_le(0);
        buf.put_u16_le(0);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::HEADER_SIZE {
            return Err(short("dual string array header", Self::HEADER_SIZE, buf.remaining()));
        }
        let num_entries = buf.get_u16_le() as usize;
        let security_offset = buf.get_u16_le() as usize;
        if security_offset > num_entries || buf.remaining() < num_entries * 2 {
            return Err(short("dual string array", num_entries * 2, buf.remaining()));
        }

        let mut units: Vec<u16> = (0..num_entries).map(|_| buf.get_u16_le()).collect();
        units.truncate(security_offset);

        let mut string_bindings = Vec::new();
        let mut pos = 0;
        while pos < units.len() {
            let tower_id = units[pos];
            pos += 1;
            if tower_id == 0 {
                break;
            }
            let end = units[pos..]
                .iter()
                .position(|&c| c == 0)
                .map(|i| pos + i)
                .ok_or_else(|| ComError::InvalidObjRef("unterminated string binding".into()))?;
            let network_addr = String::from_utf16(&units[pos..end])
                .map_err(|_| ComError::InvalidObjRef("string binding is not UTF-16".into()))?;
            string_bindings.push(StringBinding {
                tower_id,
                network_addr,
            });
            pos = end + 1;
        }

        Ok(Self { string_bindings })
    }
}

fn short(what: &str, needed: usize, have: usize) -> ComError {
    ComError::InvalidObjRef(format!("{}: need {} bytes, have {}", what, needed, have))
}
