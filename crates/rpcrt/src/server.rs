//! Server dispatch pool
//!
//! The server owns three tables, each behind its own lock:
//!
//! - registered interfaces (plus the object-to-manager-type map)
//! - protocol sequence / endpoint registrations
//! - the listen coordinator state
//!
//! Listening is reference counted. `listen()` holds one explicit reference and
//! every interface registered with auto-listen holds another. When the count
//! goes from zero to one, an accept task is started per endpoint. When it
//! drops back to zero, the accept tasks and every accepted connection are
//! shut down.
//!
//! Each accepted connection gets a reader task. Requests are dispatched
//! either inline or on the shared worker pool; a failing handler only ever
//! produces a fault packet on its own call.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, trace, warn};

use crate::binding::Binding;
use crate::connection::ConnectionKey;
use crate::error::{status, Result, RpcError};
use crate::framing::{PacketStream, DEFAULT_MAX_PAYLOAD};
use crate::interface::{CallContext, Interface};
use crate::message;
use crate::packet::{Packet, PacketType};
use crate::transport::{BoxedStream, Listener, TransportRegistry};
use crate::uuid::{SyntaxId, Uuid};
use crate::worker::WorkerPool;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrently served connections
    pub max_connections: usize,
    /// Largest request payload accepted
    pub max_payload_size: usize,
    /// Run handlers on the reader task instead of the worker pool
    pub dispatch_inline: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            dispatch_inline: false,
        }
    }
}

impl ServerConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_dispatch_inline(mut self, inline: bool) -> Self {
        self.dispatch_inline = inline;
        self
    }
}

/// Server statistics
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_processed: AtomicU64,
    pub requests_failed: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of server statistics
#[derive(Debug, Clone)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub requests_received: u64,
    pub requests_processed: u64,
    pub requests_failed: u64,
}

/// Write side of an accepted connection, shared by the calls it carries
pub struct ServerConnection {
    id: u64,
    writer: tokio::sync::Mutex<PacketStream<WriteHalf<BoxedStream>>>,
}

impl ServerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        self.writer.lock().await.write_packet(packet).await
    }
}

struct EndpointRegistration {
    key: ConnectionKey,
    /// Bound but not yet accepting; taken by the accept task while listening
    listener: Option<Box<dyn Listener>>,
}

#[derive(Default)]
struct ListenState {
    explicit: bool,
    auto_refs: usize,
    shutdown: Option<watch::Sender<bool>>,
}

impl ListenState {
    fn wanted(&self) -> bool {
        self.explicit || self.auto_refs > 0
    }
}

/// RPC server: interface registry, listen coordinator and dispatcher
pub struct RpcServer {
    config: ServerConfig,
    transports: TransportRegistry,
    pool: WorkerPool,
    interfaces: RwLock<HashMap<Uuid, Interface>>,
    object_types: RwLock<HashMap<Uuid, Uuid>>,
    endpoints: Mutex<Vec<EndpointRegistration>>,
    listen: tokio::sync::Mutex<ListenState>,
    connection_limit: Arc<Semaphore>,
    stats: ServerStats,
}

impl RpcServer {
    pub fn new(config: ServerConfig, transports: TransportRegistry, pool: WorkerPool) -> Arc<Self> {
        Arc::new(Self {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            transports,
            pool,
            interfaces: RwLock::new(HashMap::new()),
            object_types: RwLock::new(HashMap::new()),
            endpoints: Mutex::new(Vec::new()),
            listen: tokio::sync::Mutex::new(ListenState::default()),
            stats: ServerStats::default(),
        })
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind an endpoint for `protseq`. An empty endpoint lets the transport
    /// pick one. Returns the address peers should connect to.
    pub async fn use_protseq_ep(
        self: &Arc<Self>,
        protseq: &str,
        network_addr: &str,
        endpoint: &str,
    ) -> Result<ConnectionKey> {
        if !endpoint.is_empty() {
            let endpoints = self.endpoints.lock();
            if let Some(existing) = endpoints
                .iter()
                .find(|e| e.key.protseq == protseq && e.key.endpoint == endpoint)
            {
                return Ok(existing.key.clone());
            }
        }

        let transport = self.transports.get(protseq)?;
        let listener = transport.listen(network_addr, endpoint).await?;
        let key = ConnectionKey {
            protseq: protseq.to_string(),
            network_addr: listener.network_addr().to_string(),
            endpoint: listener.endpoint().to_string(),
        };
        info!(%key, "registered server endpoint");

        let listen = self.listen.lock().await;
        let listener = match &listen.shutdown {
            Some(shutdown) => {
                self.spawn_accept(listener, shutdown.subscribe());
                None
            }
            None => Some(listener),
        };
        self.endpoints.lock().push(EndpointRegistration {
            key: key.clone(),
            listener,
        });
        Ok(key)
    }

    /// Every registered endpoint
    pub fn endpoints(&self) -> Vec<ConnectionKey> {
        self.endpoints.lock().iter().map(|e| e.key.clone()).collect()
    }

    pub async fn register_interface(self: &Arc<Self>, interface: Interface) -> Result<()> {
        let uuid = interface.uuid();
        let auto_listen = interface.auto_listen;
        {
            let mut interfaces = self.interfaces.write();
            if interfaces.contains_key(&uuid) {
                return Err(RpcError::AlreadyRegistered(uuid.to_string()));
            }
            interfaces.insert(uuid, interface);
        }
        debug!(interface = %uuid, auto_listen, "registered interface");

        if auto_listen {
            let mut listen = self.listen.lock().await;
            listen.auto_refs += 1;
            self.update_listening(&mut listen).await?;
        }
        Ok(())
    }

    pub async fn unregister_interface(self: &Arc<Self>, uuid: &Uuid) -> Result<()> {
        let removed = self
            .interfaces
            .write()
            .remove(uuid)
            .ok_or_else(|| RpcError::UnknownInterface(uuid.to_string()))?;
        debug!(interface = %uuid, "unregistered interface");

        if removed.auto_listen {
            let mut listen = self.listen.lock().await;
            listen.auto_refs = listen.auto_refs.saturating_sub(1);
            self.update_listening(&mut listen).await?;
        }
        Ok(())
    }

    pub fn is_registered(&self, uuid: &Uuid) -> bool {
        self.interfaces.read().contains_key(uuid)
    }

    /// Assign a manager type to an object UUID; a nil type clears it
    pub fn set_object_type(&self, object: Uuid, type_uuid: Uuid) {
        let mut types = self.object_types.write();
        if type_uuid.is_nil() {
            types.remove(&object);
        } else {
            types.insert(object, type_uuid);
        }
    }

    /// Take the explicit listen reference
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        let mut listen = self.listen.lock().await;
        if listen.explicit {
            return Err(RpcError::AlreadyListening);
        }
        listen.explicit = true;
        self.update_listening(&mut listen).await
    }

    /// Drop the explicit listen reference
    pub async fn stop_listening(self: &Arc<Self>) -> Result<()> {
        let mut listen = self.listen.lock().await;
        if !listen.explicit {
            return Err(RpcError::NotListening);
        }
        listen.explicit = false;
        self.update_listening(&mut listen).await
    }

    pub async fn is_listening(&self) -> bool {
        self.listen.lock().await.shutdown.is_some()
    }

    async fn update_listening(self: &Arc<Self>, listen: &mut ListenState) -> Result<()> {
        match (listen.wanted(), listen.shutdown.is_some()) {
            (true, false) => {
                let (tx, rx) = watch::channel(false);
                let pending: Vec<(ConnectionKey, Option<Box<dyn Listener>>)> = self
                    .endpoints
                    .lock()
                    .iter_mut()
                    .map(|e| (e.key.clone(), e.listener.take()))
                    .collect();
                for (key, listener) in pending {
                    let listener = match listener {
                        Some(listener) => listener,
                        None => match self.rebind(&key).await {
                            Ok(listener) => listener,
                            Err(e) => {
                                warn!(%key, error = %e, "could not re-open endpoint");
                                continue;
                            }
                        },
                    };
                    self.spawn_accept(listener, rx.clone());
                }
                listen.shutdown = Some(tx);
                info!("server listening");
            }
            (false, true) => {
                if let Some(tx) = listen.shutdown.take() {
                    let _ = tx.send(true);
                }
                info!("server stopped listening");
            }
            _ => {}
        }
        Ok(())
    }

    async fn rebind(&self, key: &ConnectionKey) -> Result<Box<dyn Listener>> {
        self.transports
            .get(&key.protseq)?
            .listen(&key.network_addr, &key.endpoint)
            .await
    }

    fn spawn_accept(self: &Arc<Self>, listener: Box<dyn Listener>, shutdown: watch::Receiver<bool>) {
        let server = self.clone();
        tokio::spawn(async move { server.accept_loop(listener, shutdown).await });
    }

    async fn accept_loop(self: Arc<Self>, mut listener: Box<dyn Listener>, mut shutdown: watch::Receiver<bool>) {
        let endpoint = listener.endpoint().to_string();
        debug!(%endpoint, "accept loop started");
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(stream) => {
                    let permit = match self.connection_limit.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(%endpoint, "connection limit reached, rejecting peer");
                            continue;
                        }
                    };
                    self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                        server.clone().serve_connection(stream, shutdown).await;
                        server.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }
                Err(RpcError::ConnectionClosed) => break,
                Err(e) => warn!(%endpoint, error = %e, "accept failed"),
            }
        }
        debug!(%endpoint, "accept loop stopped");
    }

    async fn serve_connection(self: Arc<Self>, stream: BoxedStream, mut shutdown: watch::Receiver<bool>) {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let (read_half, write_half): (ReadHalf<BoxedStream>, WriteHalf<BoxedStream>) = tokio::io::split(stream);
        let conn = Arc::new(ServerConnection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            writer: tokio::sync::Mutex::new(PacketStream::new(write_half)),
        });
        let mut reader = PacketStream::new(read_half).with_max_payload(self.config.max_payload_size);
        debug!(conn = conn.id, "serving connection");

        loop {
            let packet = tokio::select! {
                _ = shutdown.changed() => break,
                packet = reader.read_packet() => packet,
            };
            let packet = match packet {
                Ok(packet) => packet,
                Err(RpcError::ConnectionClosed) => break,
                Err(e) => {
                    warn!(conn = conn.id, error = %e, "dropping connection after read error");
                    break;
                }
            };
            self.stats.requests_received.fetch_add(1, Ordering::Relaxed);

            if packet.header.packet_type != PacketType::Request {
                warn!(
                    conn = conn.id,
                    ptype = packet.header.packet_type.name(),
                    "unexpected packet on server connection"
                );
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                let fault = Packet::fault(&packet.header, status::RPC_S_PROTOCOL_ERROR);
                if conn.send(&fault).await.is_err() {
                    break;
                }
                continue;
            }

            if self.config.dispatch_inline {
                self.dispatch(&conn, packet).await;
            } else {
                let server = self.clone();
                let conn = conn.clone();
                self.pool.submit(async move { server.dispatch(&conn, packet).await });
            }
        }
        debug!(conn = conn.id, "connection closed");
    }

    /// Run one request and send its response or fault on `conn`
    pub(crate) async fn dispatch(&self, conn: &Arc<ServerConnection>, packet: Packet) {
        let header = packet.header.clone();
        let binding = Arc::new(Binding::server(header.object, Some(conn.clone())));
        let outcome = self.invoke(binding.clone(), packet).await;
        match &outcome {
            Ok(_) => {
                self.stats.requests_processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    interface = %header.interface,
                    opnum = header.opnum,
                    error = %e,
                    "call faulted"
                );
            }
        }
        if let Err(e) = message::send_reply(&binding, &header, outcome).await {
            warn!(conn = conn.id, error = %e, "failed to send reply");
        }
    }

    async fn invoke(&self, binding: Arc<Binding>, packet: Packet) -> Result<Bytes> {
        let header = packet.header;
        let interface = self.lookup(&header.object, &header.interface)?;
        let requested = SyntaxId {
            uuid: header.interface,
            version: header.interface_version,
        };
        if requested.major() != interface.syntax.major() {
            return Err(RpcError::UnknownInterface(requested.to_string()));
        }
        let handler = interface.handler(header.opnum)?;
        trace!(interface = %header.interface, opnum = header.opnum, "dispatching");

        let ctx = CallContext {
            binding,
            interface: interface.syntax,
            opnum: header.opnum,
            header,
        };
        let call = async move { handler(ctx, packet.payload).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!("handler panicked");
                Err(RpcError::CallFailed)
            }
        }
    }

    fn lookup(&self, object: &Uuid, interface: &Uuid) -> Result<Interface> {
        let found = self
            .interfaces
            .read()
            .get(interface)
            .cloned()
            .ok_or_else(|| RpcError::UnknownInterface(interface.to_string()))?;
        if !found.manager_type.is_nil() {
            let object_type = self.object_types.read().get(object).copied();
            if object_type != Some(found.manager_type) {
                return Err(RpcError::UnknownManagerType(object.to_string()));
            }
        }
        Ok(found)
    }
}
