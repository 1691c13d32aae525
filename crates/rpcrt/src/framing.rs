//! Packet framing over a byte stream
//!
//! Packets are self-delimiting: the header's payload length says how many
//! bytes follow it. A clean end-of-stream between packets is reported as
//! [`RpcError::ConnectionClosed`]; end-of-stream inside a packet is a short read.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::packet::{Packet, PacketHeader};

/// Default maximum payload accepted from a peer
pub const DEFAULT_MAX_PAYLOAD: usize = u16::MAX as usize;

/// Reads and writes whole packets on a byte stream
pub struct PacketStream<T> {
    inner: T,
    max_payload: usize,
}

impl<T> PacketStream<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: AsyncRead + Unpin> PacketStream<T> {
    /// Read exactly one packet
    pub async fn read_packet(&mut self) -> Result<Packet> {
        let mut raw = [0u8; PacketHeader::SIZE];
        let got = self.fill(&mut raw).await?;
        if got == 0 {
            return Err(RpcError::ConnectionClosed);
        }
        if got < PacketHeader::SIZE {
            return Err(RpcError::ShortRead {
                needed: PacketHeader::SIZE,
                have: got,
            });
        }

        let header = PacketHeader::decode(&mut &raw[..])?;
        let len = header.payload_length as usize;
        if len > self.max_payload {
            return Err(RpcError::PayloadTooLarge {
                size: len,
                max: self.max_payload,
            });
        }

        let mut payload = BytesMut::zeroed(len);
        let got = self.fill(&mut payload).await?;
        if got < len {
            return Err(RpcError::ShortRead { needed: len, have: got });
        }

        Ok(Packet {
            header,
            payload: payload.freeze(),
        })
    }

    /// Fill `buf` until it is full or the stream ends; returns bytes read
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

impl<T: AsyncWrite + Unpin> PacketStream<T> {
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let data: Bytes = packet.encode();
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use crate::uuid::Uuid;
    use tokio::io::duplex;

    fn request(payload: &'static [u8]) -> Packet {
        let header = PacketHeader::request(Uuid::NIL, Uuid::from_u128(7), 1, 3);
        Packet::new(header, Bytes::from_static(payload)).unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (client, server) = duplex(1024);
        let mut writer = PacketStream::new(client);
        let mut reader = PacketStream::new(server);

        writer.write_packet(&request(b"hello")).await.unwrap();
        writer.write_packet(&request(b"")).await.unwrap();

        let first = reader.read_packet().await.unwrap();
        assert_eq!(first.header.packet_type, PacketType::Request);
        assert_eq!(first.header.opnum, 3);
        assert_eq!(&first.payload[..], b"hello");
        let second = reader.read_packet().await.unwrap();
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn test_clean_close() {
        let (client, server) = duplex(1024);
        drop(client);
        let mut reader = PacketStream::new(server);
        assert!(matches!(reader.read_packet().await, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let (mut client, server) = duplex(1024);
        client.write_all(&[4, 0, 0]).await.unwrap();
        drop(client);
        let mut reader = PacketStream::new(server);
        assert!(matches!(
            reader.read_packet().await,
            Err(RpcError::ShortRead { needed: 80, have: 3 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let (mut client, server) = duplex(1024);
        let encoded = request(b"0123456789").encode();
        client.write_all(&encoded[..encoded.len() - 4]).await.unwrap();
        drop(client);
        let mut reader = PacketStream::new(server);
        assert!(matches!(
            reader.read_packet().await,
            Err(RpcError::ShortRead { needed: 10, have: 6 })
        ));
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let (client, server) = duplex(1024);
        let mut writer = PacketStream::new(client);
        let mut reader = PacketStream::new(server).with_max_payload(4);
        writer.write_packet(&request(b"too long")).await.unwrap();
        assert!(matches!(
            reader.read_packet().await,
            Err(RpcError::PayloadTooLarge { size: 8, max: 4 })
        ));
    }
}
