//! Lightweight connectionless-style RPC runtime
//!
//! This crate carries request, response and fault packets over byte-stream
//! transports and dispatches them to registered interfaces. It is the
//! transport layer underneath the `comrt` object runtime but is usable on
//! its own.
//!
//! # Features
//!
//! - 80-byte packet header with per-binding activity and sequence numbers
//! - `ncalrpc` (in-process pipes) and `ncacn_ip_tcp` (loopback TCP) transports
//! - Client connection cache shared by every binding with the same destination
//! - Endpoint directory, in-process or hosted as an RPC interface
//! - Reference-counted listening with auto-listen interfaces
//! - Bounded worker pool with idle-timeout shrinking
//!
//! # Example
//!
//! ```no_run
//! use rpcrt::{Binding, InterfaceBuilder, RpcRuntime, RuntimeConfig};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runtime = RpcRuntime::new(RuntimeConfig::default());
//!     let key = runtime.server().use_protseq_ep("ncalrpc", "", "echo").await.unwrap();
//!
//!     let interface = InterfaceBuilder::new("12345678-1234-1234-1234-123456789012", 1, 0)
//!         .unwrap()
//!         .operation(0, |args: Bytes| async move { Ok(args) })
//!         .auto_listen()
//!         .build();
//!     let syntax = interface.syntax();
//!     runtime.server().register_interface(interface).await.unwrap();
//!
//!     let binding = Binding::client("ncalrpc", "", &key.endpoint);
//!     let mut msg = runtime.get_buffer(&binding, syntax, 0, 5).await.unwrap();
//!     msg.buffer.extend_from_slice(b"hello");
//!     let reply = runtime.send_and_receive(&binding, &mut msg).await.unwrap();
//!     assert_eq!(reply.as_ref(), b"hello");
//! }
//! ```

pub mod binding;
pub mod connection;
pub mod epm;
pub mod error;
pub mod framing;
pub mod interface;
pub mod message;
pub mod packet;
pub mod runtime;
pub mod server;
pub mod string_binding;
pub mod transport;
pub mod uuid;
pub mod worker;

pub use binding::{Binding, Role};
pub use connection::{Connection, ConnectionCache, ConnectionKey, Connector};
pub use epm::{
    resolve_binding, EndpointBinding, EndpointDirectory, EpmClient, EpmEntry, EpmRegistry,
};
pub use error::{status, Result, RpcError};
pub use framing::PacketStream;
pub use interface::{CallContext, HandlerFuture, Interface, InterfaceBuilder, OperationHandler};
pub use message::RpcMessage;
pub use packet::{DataRepresentation, Packet, PacketHeader, PacketType};
pub use runtime::{DirectoryConfig, RpcRuntime, RuntimeConfig};
pub use server::{RpcServer, ServerConfig, ServerConnection, ServerStats, ServerStatsSnapshot};
pub use string_binding::{compose_string_binding, parse_string_binding, StringBinding};
pub use transport::{protseq, tower_id, LocalTransport, TcpTransport, Transport, TransportRegistry};
pub use crate::uuid::{SyntaxId, Uuid};
pub use worker::{Job, WorkerPool, WorkerPoolConfig, WorkerPoolStats};
