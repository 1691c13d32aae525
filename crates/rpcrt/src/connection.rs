//! Client connections and the process-wide idle connection cache
//!
//! A client connection is owned by exactly one call at a time: [`Connector::open`]
//! moves it out of the cache (or opens a new one) and [`Connector::close`]
//! either returns it or drops it. Server-side connections never enter the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::binding::{Binding, Role};
use crate::error::{Result, RpcError};
use crate::framing::{PacketStream, DEFAULT_MAX_PAYLOAD};
use crate::packet::Packet;
use crate::transport::{BoxedStream, TransportRegistry};

/// Cache key: connections are interchangeable when all three match
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub protseq: String,
    pub network_addr: String,
    pub endpoint: String,
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}[{}]", self.protseq, self.network_addr, self.endpoint)
    }
}

/// An open client connection
pub struct Connection {
    id: u64,
    key: ConnectionKey,
    stream: PacketStream<BoxedStream>,
}

impl Connection {
    fn new(key: ConnectionKey, stream: BoxedStream, max_payload: usize) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            key,
            stream: PacketStream::new(stream).with_max_payload(max_payload),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.stream.write_packet(packet).await
    }

    pub async fn read_packet(&mut self) -> Result<Packet> {
        self.stream.read_packet().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

/// Idle client connections, keyed by destination
#[derive(Default)]
pub struct ConnectionCache {
    idle: Mutex<HashMap<ConnectionKey, Vec<Connection>>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an idle connection for `key`, if any
    pub fn take(&self, key: &ConnectionKey) -> Option<Connection> {
        let mut idle = self.idle.lock();
        let conns = idle.get_mut(key)?;
        let conn = conns.pop();
        if conns.is_empty() {
            idle.remove(key);
        }
        conn
    }

    pub fn put(&self, conn: Connection) {
        self.idle.lock().entry(conn.key.clone()).or_default().push(conn);
    }

    /// Number of idle connections held
    pub fn len(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every idle connection to `key`
    pub fn purge(&self, key: &ConnectionKey) {
        self.idle.lock().remove(key);
    }
}

/// Opens and recycles client connections
pub struct Connector {
    transports: TransportRegistry,
    cache: ConnectionCache,
    connect_retries: u32,
    retry_delay: Duration,
    max_payload: usize,
}

impl Connector {
    pub fn new(transports: TransportRegistry, connect_retries: u32, retry_delay: Duration) -> Self {
        Self {
            transports,
            cache: ConnectionCache::new(),
            connect_retries,
            retry_delay,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    /// Open a connection for a client binding: reuse an idle one or connect,
    /// retrying while the listener reports busy.
    pub async fn open(&self, binding: &Binding) -> Result<Connection> {
        if binding.role() != Role::Client {
            return Err(RpcError::WrongKindOfBinding);
        }
        let key = binding.connection_key();
        if key.endpoint.is_empty() {
            return Err(RpcError::InvalidBinding(format!(
                "binding to {}:{} has no endpoint",
                key.protseq, key.network_addr
            )));
        }

        let reused = if binding.is_exclusive() {
            binding.take_private()
        } else {
            self.cache.take(&key)
        };
        if let Some(conn) = reused {
            trace!(conn = conn.id, %key, "reusing connection");
            return Ok(conn);
        }

        let transport = self.transports.get(&key.protseq)?;
        let mut attempt = 0;
        let stream = loop {
            match transport.connect(&key.network_addr, &key.endpoint).await {
                Ok(stream) => break stream,
                Err(RpcError::ServerTooBusy) if attempt < self.connect_retries => {
                    attempt += 1;
                    debug!(%key, attempt, "endpoint busy, retrying connect");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        let conn = Connection::new(key, stream, self.max_payload);
        debug!(conn = conn.id, key = %conn.key, "opened connection");
        Ok(conn)
    }

    /// Give a connection back after a call. Exclusive bindings keep theirs;
    /// everything else goes back to the cache. A connection that saw a fatal
    /// error is dropped instead.
    pub fn close(&self, binding: &Binding, conn: Connection, reusable: bool) {
        if !reusable {
            warn!(conn = conn.id, key = %conn.key, "dropping connection after transport error");
        } else if binding.is_exclusive() {
            binding.store_private(conn);
        } else {
            trace!(conn = conn.id, "returning connection to cache");
            self.cache.put(conn);
        }
    }
}
