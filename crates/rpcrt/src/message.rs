//! Framing calls onto a binding's connection
//!
//! Client role: [`send`] frames a request and keeps the connection inside the
//! message; [`receive`] reads the matching response or fault and hands the
//! connection back. Server role: [`send_reply`] frames a response, or a fault
//! if the call failed, on the connection the request came in on.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::binding::{Binding, Role};
use crate::connection::{Connection, Connector};
use crate::error::{Result, RpcError};
use crate::packet::{Packet, PacketHeader, PacketType};
use crate::uuid::SyntaxId;

/// One outbound call: the marshaled request and, while in flight, the
/// connection carrying it
pub struct RpcMessage {
    pub interface: SyntaxId,
    pub opnum: u16,
    pub buffer: BytesMut,
    conn: Option<Connection>,
    sent: Option<PacketHeader>,
}

impl RpcMessage {
    pub fn new(interface: SyntaxId, opnum: u16, capacity: usize) -> Self {
        Self {
            interface,
            opnum,
            buffer: BytesMut::with_capacity(capacity),
            conn: None,
            sent: None,
        }
    }

    /// True between a successful send and the matching receive
    pub fn in_flight(&self) -> bool {
        self.sent.is_some()
    }
}

impl std::fmt::Debug for RpcMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMessage")
            .field("interface", &self.interface)
            .field("opnum", &self.opnum)
            .field("len", &self.buffer.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Frame `msg` as a request on a connection opened for `binding`
pub async fn send(connector: &Connector, binding: &Binding, msg: &mut RpcMessage) -> Result<()> {
    if binding.role() != Role::Client {
        return Err(RpcError::WrongKindOfBinding);
    }
    let mut conn = match msg.conn.take() {
        Some(conn) => conn,
        None => connector.open(binding).await?,
    };

    let mut header = PacketHeader::request(
        binding.object(),
        msg.interface.uuid,
        msg.interface.version,
        msg.opnum,
    );
    header.activity = binding.activity();
    header.seqnum = binding.next_seqnum();

    let payload = msg.buffer.split().freeze();
    let packet = match Packet::new(header, payload) {
        Ok(packet) => packet,
        Err(e) => {
            connector.close(binding, conn, true);
            return Err(e);
        }
    };

    trace!(conn = conn.id(), opnum = msg.opnum, len = packet.payload.len(), "sending request");
    if let Err(e) = conn.write_packet(&packet).await {
        connector.close(binding, conn, false);
        return Err(e);
    }
    msg.sent = Some(packet.header);
    msg.conn = Some(conn);
    Ok(())
}

/// Read the reply to the request last sent with `msg`
pub async fn receive(connector: &Connector, binding: &Binding, msg: &mut RpcMessage) -> Result<Bytes> {
    let (mut conn, sent) = match (msg.conn.take(), msg.sent.take()) {
        (Some(conn), Some(sent)) => (conn, sent),
        _ => return Err(RpcError::Protocol("receive without a request in flight".into())),
    };

    let reply = match conn.read_packet().await {
        Ok(reply) => reply,
        Err(e) => {
            connector.close(binding, conn, false);
            return Err(e);
        }
    };

    if let Err(e) = check_reply(&sent, &reply.header) {
        connector.close(binding, conn, false);
        return Err(e);
    }
    connector.close(binding, conn, true);

    match reply.header.packet_type {
        PacketType::Fault => Err(RpcError::Fault(reply.fault_status()?)),
        _ => Ok(reply.payload),
    }
}

fn check_reply(sent: &PacketHeader, reply: &PacketHeader) -> Result<()> {
    if reply.packet_type == PacketType::Request {
        return Err(RpcError::UnexpectedPacketType {
            expected: "response",
            got: reply.packet_type as u8,
        });
    }
    if reply.activity != sent.activity || reply.seqnum != sent.seqnum {
        return Err(RpcError::Protocol(format!(
            "reply for seq {} on {} does not match request seq {}",
            reply.seqnum, reply.activity, sent.seqnum
        )));
    }
    Ok(())
}

/// One full round trip
pub async fn send_and_receive(
    connector: &Connector,
    binding: &Binding,
    msg: &mut RpcMessage,
) -> Result<Bytes> {
    send(connector, binding, msg).await?;
    receive(connector, binding, msg).await
}

/// Release a message's buffer. A request still awaiting its reply leaves
/// the connection in an unknown state, so that connection is dropped.
pub fn free_buffer(connector: &Connector, binding: &Binding, msg: &mut RpcMessage) {
    msg.buffer = BytesMut::new();
    msg.sent = None;
    if let Some(conn) = msg.conn.take() {
        connector.close(binding, conn, false);
    }
}

/// Server role: answer `request` with the call's outcome
pub async fn send_reply(binding: &Binding, request: &PacketHeader, outcome: Result<Bytes>) -> Result<()> {
    if binding.role() != Role::Server {
        return Err(RpcError::WrongKindOfBinding);
    }
    let conn = binding
        .server_connection()
        .ok_or_else(|| RpcError::InvalidBinding("server binding has no connection".into()))?;

    let packet = match outcome {
        Ok(payload) => Packet::new(PacketHeader::reply_to(request, PacketType::Response), payload)
            .unwrap_or_else(|e| Packet::fault(request, e.status())),
        Err(e) => Packet::fault(request, e.status()),
    };
    conn.send(&packet).await
}
