//! Byte-stream transports
//!
//! A transport knows how to listen on an endpoint and how to connect to one.
//! Everything above this layer only sees [`BoxedStream`]s.
//!
//! Two protocol sequences are provided:
//!
//! - `ncalrpc`: in-process pipes with a process-wide endpoint namespace
//! - `ncacn_ip_tcp`: loopback TCP, endpoint is the port number

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, RpcError};

pub mod local;
pub mod tcp;

pub use local::LocalTransport;
pub use tcp::TcpTransport;

/// Protocol sequence names
pub mod protseq {
    pub const NCALRPC: &str = "ncalrpc";
    pub const NCACN_IP_TCP: &str = "ncacn_ip_tcp";
}

/// Tower identifiers used in string-binding lists
pub mod tower_id {
    pub const NCACN_IP_TCP: u16 = 0x07;
    pub const NCALRPC: u16 = 0x10;
}

/// A connected, bidirectional byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// A protocol sequence implementation
#[async_trait]
pub trait Transport: Send + Sync {
    /// Protocol sequence name, e.g. `ncalrpc`
    fn protseq(&self) -> &'static str;

    /// Tower identifier advertised in string-binding lists
    fn tower_id(&self) -> u16;

    /// Start listening; an empty endpoint asks the transport to pick one
    async fn listen(&self, network_addr: &str, endpoint: &str) -> Result<Box<dyn Listener>>;

    /// Connect to a listening endpoint.
    ///
    /// Returns [`RpcError::ServerTooBusy`] when the listener cannot take
    /// another connection right now; callers retry on that condition.
    async fn connect(&self, network_addr: &str, endpoint: &str) -> Result<BoxedStream>;
}

/// A listening endpoint
#[async_trait]
pub trait Listener: Send {
    /// Network address peers should use to reach this listener
    fn network_addr(&self) -> &str;

    /// Endpoint actually bound (resolved if an empty endpoint was requested)
    fn endpoint(&self) -> &str;

    async fn accept(&mut self) -> Result<BoxedStream>;
}

/// Transports by protocol sequence
#[derive(Clone)]
pub struct TransportRegistry {
    transports: HashMap<&'static str, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn empty() -> Self {
        Self {
            transports: HashMap::new(),
        }
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.protseq(), transport);
    }

    pub fn get(&self, protseq: &str) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(protseq)
            .cloned()
            .ok_or_else(|| RpcError::ProtseqNotSupported(protseq.to_string()))
    }

    /// Protocol sequence for a tower identifier
    pub fn by_tower_id(&self, tower_id: u16) -> Option<Arc<dyn Transport>> {
        self.transports
            .values()
            .find(|t| t.tower_id() == tower_id)
            .cloned()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(LocalTransport::new()));
        registry.register(Arc::new(TcpTransport::new()));
        registry
    }
}
