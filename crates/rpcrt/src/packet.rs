//! Packet header and framing codec
//!
//! Every packet is a fixed 80-byte header followed by `len` payload bytes.
//! The header layout:
//!
//! ```text
//!  0  rpc_vers  ptype  flags1  flags2
//!  4  drep[3]                  serial_hi
//!  8  object uuid       (16)
//! 24  interface uuid    (16)
//! 40  activity uuid     (16)
//! 56  server_boot (u32)
//! 60  if_vers     (u32)
//! 64  seqnum      (u32)
//! 68  opnum (u16)   ihint (u16)
//! 72  ahint (u16)   len   (u16)
//! 76  fragnum (u16) auth_proto  serial_lo
//! ```
//!
//! Multi-byte fields use the byte order announced in `drep[0]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::uuid::Uuid;

/// Protocol version carried in every header
pub const RPC_VERSION: u8 = 4;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Fault),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Fault => "fault",
        }
    }
}

/// Header flag bits (flags1)
pub mod flags {
    pub const LAST_FRAG: u8 = 0x02;
    pub const NO_FACK: u8 = 0x08;
    pub const IDEMPOTENT: u8 = 0x20;
}

/// Data representation tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation(pub [u8; 3]);

impl DataRepresentation {
    /// Little-endian integers, ASCII characters, IEEE floats
    pub const LITTLE_ENDIAN: Self = Self([0x10, 0x00, 0x00]);
    /// Big-endian integers, ASCII characters, IEEE floats
    pub const BIG_ENDIAN: Self = Self([0x00, 0x00, 0x00]);

    pub fn is_little_endian(&self) -> bool {
        self.0[0] & 0x10 != 0
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::LITTLE_ENDIAN
    }
}

/// Fixed-size packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags1: u8,
    pub flags2: u8,
    pub drep: DataRepresentation,
    pub object: Uuid,
    pub interface: Uuid,
    pub activity: Uuid,
    pub server_boot: u32,
    pub interface_version: u32,
    pub seqnum: u32,
    pub opnum: u16,
    pub interface_hint: u16,
    pub activity_hint: u16,
    pub payload_length: u16,
    pub fragnum: u16,
    pub auth_proto: u8,
    pub serial: u16,
}

impl PacketHeader {
    pub const SIZE: usize = 80;

    /// Header for a request to `interface`
    pub fn request(object: Uuid, interface: Uuid, interface_version: u32, opnum: u16) -> Self {
        Self {
            version: RPC_VERSION,
            packet_type: PacketType::Request,
            flags1: flags::LAST_FRAG,
            flags2: 0,
            drep: DataRepresentation::LITTLE_ENDIAN,
            object,
            interface,
            activity: Uuid::NIL,
            server_boot: 0,
            interface_version,
            seqnum: 0,
            opnum,
            interface_hint: 0xffff,
            activity_hint: 0xffff,
            payload_length: 0,
            fragnum: 0,
            auth_proto: 0,
            serial: 0,
        }
    }

    /// Header answering `request` with the given packet type.
    /// Object, interface, activity and sequence number are echoed back.
    pub fn reply_to(request: &PacketHeader, packet_type: PacketType) -> Self {
        Self {
            packet_type,
            drep: DataRepresentation::LITTLE_ENDIAN,
            ..request.clone()
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let le = self.drep.is_little_endian();
        buf.put_u8(self.version);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags1);
        buf.put_u8(self.flags2);
        buf.put_slice(&self.drep.0);
        buf.put_u8((self.serial >> 8) as u8);
        self.object.encode(buf, le);
        self.interface.encode(buf, le);
        self.activity.encode(buf, le);
        if le {
            buf.put_u32_le(self.server_boot);
            buf.put_u32_le(self.interface_version);
            buf.put_u32_le(self.seqnum);
            buf.put_u16_le(self.opnum);
            buf.put_u16_le(self.interface_hint);
            buf.put_u16_le(self.activity_hint);
            buf.put_u16_le(self.payload_length);
            buf.put_u16_le(self.fragnum);
        } else {
            buf.put_u32(self.server_boot);
            buf.put_u32(self.interface_version);
            buf.put_u32(self.seqnum);
            buf.put_u16(self.opnum);
            buf.put_u16(self.interface_hint);
            buf.put_u16(self.activity_hint);
            buf.put_u16(self.payload_length);
            buf.put_u16(self.fragnum);
        }
        buf.put_u8(self.auth_proto);
        buf.put_u8(self.serial as u8);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(RpcError::ShortRead {
                needed: Self::SIZE,
                have: buf.remaining(),
            });
        }

        let version = buf.get_u8();
        if version != RPC_VERSION {
            return Err(RpcError::VersionMismatch {
                expected: RPC_VERSION,
                got: version,
            });
        }
        let ptype = buf.get_u8();
        let packet_type = PacketType::from_u8(ptype)
            .ok_or_else(|| RpcError::Protocol(format!("unknown packet type {}", ptype)))?;
        let flags1 = buf.get_u8();
        let flags2 = buf.get_u8();
        let drep = DataRepresentation([buf.get_u8(), buf.get_u8(), buf.get_u8()]);
        let serial_hi = buf.get_u8();
        let le = drep.is_little_endian();
        let object = Uuid::decode(buf, le)?;
        let interface = Uuid::decode(buf, le)?;
        let activity = Uuid::decode(buf, le)?;

        let get_u32 = |buf: &mut B| if le { buf.get_u32_le() } else { buf.get_u32() };
        let get_u16 = |buf: &mut B| if le { buf.get_u16_le() } else { buf.get_u16() };
        let server_boot = get_u32(buf);
        let interface_version = get_u32(buf);
        let seqnum = get_u32(buf);
        let opnum = get_u16(buf);
        let interface_hint = get_u16(buf);
        let activity_hint = get_u16(buf);
        let payload_length = get_u16(buf);
        let fragnum = get_u16(buf);
        let auth_proto = buf.get_u8();
        let serial_lo = buf.get_u8();

        Ok(Self {
            version,
            packet_type,
            flags1,
            flags2,
            drep,
            object,
            interface,
            activity,
            server_boot,
            interface_version,
            seqnum,
            opnum,
            interface_hint,
            activity_hint,
            payload_length,
            fragnum,
            auth_proto,
            serial: ((serial_hi as u16) << 8) | serial_lo as u16,
        })
    }
}

/// A complete packet: header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet, setting the header's payload length.
    /// Fails if the payload does not fit the 16-bit length field.
    pub fn new(mut header: PacketHeader, payload: Bytes) -> Result<Self> {
        header.payload_length = u16::try_from(payload.len()).map_err(|_| RpcError::PayloadTooLarge {
            size: payload.len(),
            max: u16::MAX as usize,
        })?;
        Ok(Self { header, payload })
    }

    /// Fault answering `request`; the payload is the single status code
    pub fn fault(request: &PacketHeader, status: u32) -> Self {
        let mut header = PacketHeader::reply_to(request, PacketType::Fault);
        header.payload_length = 4;
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32_le(status);
        Self {
            header,
            payload: payload.freeze(),
        }
    }

    /// Status code of a fault packet
    pub fn fault_status(&self) -> Result<u32> {
        if self.payload.len() < 4 {
            return Err(RpcError::ShortRead {
                needed: 4,
                have: self.payload.len(),
            });
        }
        let mut p = &self.payload[..4];
        Ok(if self.header.drep.is_little_endian() {
            p.get_u32_le()
        } else {
            p.get_u32()
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PacketHeader::SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
