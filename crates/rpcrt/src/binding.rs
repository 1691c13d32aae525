//! Bindings: where a call goes and on whose behalf
//!
//! A client binding names a destination (protocol sequence, network address,
//! endpoint) and an optional object UUID. It does not hold a connection
//! unless it is exclusive, in which case it keeps one private connection for
//! its whole lifetime. A server binding is created per inbound call and
//! refers to the accepted connection the call arrived on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::connection::{Connection, ConnectionKey};
use crate::error::Result;
use crate::server::ServerConnection;
use crate::string_binding::{compose_string_binding, parse_string_binding};
use crate::uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

pub struct Binding {
    role: Role,
    protseq: String,
    network_addr: String,
    endpoint: Mutex<String>,
    object: Uuid,
    activity: Uuid,
    seqnum: AtomicU32,
    exclusive: bool,
    private: Mutex<Option<Connection>>,
    server_conn: Option<Arc<ServerConnection>>,
    refs: AtomicU32,
}

impl Binding {
    /// Client binding; no connection is opened here
    pub fn client(protseq: &str, network_addr: &str, endpoint: &str) -> Self {
        Self {
            role: Role::Client,
            protseq: protseq.to_string(),
            network_addr: network_addr.to_string(),
            endpoint: Mutex::new(endpoint.to_string()),
            object: Uuid::NIL,
            activity: Uuid::generate(),
            seqnum: AtomicU32::new(0),
            exclusive: false,
            private: Mutex::new(None),
            server_conn: None,
            refs: AtomicU32::new(1),
        }
    }

    /// Client binding from `[object@]protseq:addr[endpoint]`
    pub fn from_string_binding(s: &str) -> Result<Self> {
        let parsed = parse_string_binding(s)?;
        Ok(Self::client(&parsed.protseq, &parsed.network_addr, &parsed.endpoint)
            .with_object(parsed.object))
    }

    /// Server binding for one inbound call
    pub fn server(object: Uuid, conn: Option<Arc<ServerConnection>>) -> Self {
        Self {
            role: Role::Server,
            protseq: String::new(),
            network_addr: String::new(),
            endpoint: Mutex::new(String::new()),
            object,
            activity: Uuid::NIL,
            seqnum: AtomicU32::new(0),
            exclusive: true,
            private: Mutex::new(None),
            server_conn: conn,
            refs: AtomicU32::new(1),
        }
    }

    pub fn with_object(mut self, object: Uuid) -> Self {
        self.object = object;
        self
    }

    /// Keep a private connection instead of using the shared cache
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn protseq(&self) -> &str {
        &self.protseq
    }

    pub fn network_addr(&self) -> &str {
        &self.network_addr
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.lock().clone()
    }

    pub fn object(&self) -> Uuid {
        self.object
    }

    pub fn activity(&self) -> Uuid {
        self.activity
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_resolved(&self) -> bool {
        !self.endpoint.lock().is_empty()
    }

    /// Replace the endpoint (after endpoint resolution)
    pub fn set_endpoint(&self, endpoint: &str) {
        *self.endpoint.lock() = endpoint.to_string();
    }

    /// Next call sequence number on this binding
    pub fn next_seqnum(&self) -> u32 {
        self.seqnum.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey {
            protseq: self.protseq.clone(),
            network_addr: self.network_addr.clone(),
            endpoint: self.endpoint(),
        }
    }

    pub fn to_string_binding(&self) -> String {
        compose_string_binding(
            Some(&self.object),
            &self.protseq,
            &self.network_addr,
            &self.endpoint(),
        )
    }

    pub(crate) fn server_connection(&self) -> Option<&Arc<ServerConnection>> {
        self.server_conn.as_ref()
    }

    pub(crate) fn take_private(&self) -> Option<Connection> {
        self.private.lock().take()
    }

    pub(crate) fn store_private(&self, conn: Connection) {
        *self.private.lock() = Some(conn);
    }

    /// Take another reference on a shared binding
    pub fn export(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference; the private connection is closed when the last one
    /// goes. Returns true if this call tore the binding down.
    pub fn destroy(&self) -> bool {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev == 1 {
            if let Some(conn) = self.private.lock().take() {
                debug!(conn = conn.id(), "closing private connection of destroyed binding");
            }
            true
        } else {
            false
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("role", &self.role)
            .field("string", &self.to_string_binding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protseq;

    #[test]
    fn test_client_binding_is_pure_data() {
        let binding = Binding::client(protseq::NCALRPC, "", "");
        assert_eq!(binding.role(), Role::Client);
        assert!(!binding.is_resolved());
        assert!(binding.object().is_nil());
        binding.set_endpoint("OLE42");
        assert!(binding.is_resolved());
        assert_eq!(binding.to_string_binding(), "ncalrpc:[OLE42]");
    }

    #[test]
    fn test_from_string_binding() {
        let binding =
            Binding::from_string_binding("00000000-0000-0000-0000-000000000007@ncacn_ip_tcp:127.0.0.1[9000]")
                .unwrap();
        assert_eq!(binding.protseq(), "ncacn_ip_tcp");
        assert_eq!(binding.network_addr(), "127.0.0.1");
        assert_eq!(binding.endpoint(), "9000");
        assert_eq!(binding.object(), Uuid::from_u128(7));
    }

    #[test]
    fn test_export_destroy() {
        let binding = Binding::client(protseq::NCALRPC, "", "x");
        assert_eq!(binding.export(), 2);
        assert!(!binding.destroy());
        assert!(binding.destroy());
        assert_eq!(binding.ref_count(), 0);
        assert!(!binding.destroy());
    }

    #[test]
    fn test_seqnum_increments() {
        let binding = Binding::client(protseq::NCALRPC, "", "x");
        assert_eq!(binding.next_seqnum(), 0);
        assert_eq!(binding.next_seqnum(), 1);
    }
}
