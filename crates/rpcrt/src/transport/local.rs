//! In-process pipe transport (`ncalrpc`)
//!
//! Endpoints live in a process-wide namespace. Each connect creates a
//! `tokio::io::duplex` pair and hands one half to the listener through a
//! bounded accept backlog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tracing::debug;

use super::{protseq, tower_id, BoxedStream, Listener, Transport};
use crate::error::{Result, RpcError};

/// Pipe buffer size, large enough for one maximal packet
pub const PIPE_BUFFER_SIZE: usize = 128 * 1024;

/// Pending connections a listener may hold before connects report busy
pub const DEFAULT_BACKLOG: usize = 16;

type Namespace = Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>;

fn namespace() -> &'static Namespace {
    static NAMESPACE: OnceLock<Namespace> = OnceLock::new();
    NAMESPACE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn generate_endpoint() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!(
        "LRPC-{:08x}-{:04x}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

/// In-process transport
#[derive(Debug, Clone)]
pub struct LocalTransport {
    backlog: usize,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
        }
    }

    pub fn with_backlog(backlog: usize) -> Self {
        Self {
            backlog: backlog.max(1),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn protseq(&self) -> &'static str {
        protseq::NCALRPC
    }

    fn tower_id(&self) -> u16 {
        tower_id::NCALRPC
    }

    async fn listen(&self, _network_addr: &str, endpoint: &str) -> Result<Box<dyn Listener>> {
        let endpoint = if endpoint.is_empty() {
            generate_endpoint()
        } else {
            endpoint.to_string()
        };

        let (tx, rx) = mpsc::channel(self.backlog);
        {
            let mut names = namespace().lock();
            if let Some(existing) = names.get(&endpoint) {
                if !existing.is_closed() {
                    return Err(RpcError::EndpointInUse(endpoint));
                }
            }
            names.insert(endpoint.clone(), tx.clone());
        }
        debug!(endpoint = %endpoint, "ncalrpc endpoint listening");

        Ok(Box::new(LocalListener {
            endpoint,
            registered: tx,
            incoming: rx,
        }))
    }

    async fn connect(&self, _network_addr: &str, endpoint: &str) -> Result<BoxedStream> {
        let sender = namespace()
            .lock()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| RpcError::ServerUnavailable(format!("ncalrpc:[{}]", endpoint)))?;

        let (client, server) = duplex(PIPE_BUFFER_SIZE);
        match sender.try_send(server) {
            Ok(()) => Ok(Box::new(client)),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RpcError::ServerTooBusy),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RpcError::ServerUnavailable(format!("ncalrpc:[{}]", endpoint)))
            }
        }
    }
}

struct LocalListener {
    endpoint: String,
    registered: mpsc::Sender<DuplexStream>,
    incoming: mpsc::Receiver<DuplexStream>,
}

#[async_trait]
impl Listener for LocalListener {
    fn network_addr(&self) -> &str {
        ""
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn accept(&mut self) -> Result<BoxedStream> {
        self.incoming
            .recv()
            .await
            .map(|stream| Box::new(stream) as BoxedStream)
            .ok_or(RpcError::ConnectionClosed)
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        let mut names = namespace().lock();
        if names
            .get(&self.endpoint)
            .is_some_and(|tx| tx.same_channel(&self.registered))
        {
            names.remove(&self.endpoint);
        }
        debug!(endpoint = %self.endpoint, "ncalrpc endpoint closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_and_accept() {
        let transport = LocalTransport::new();
        let mut listener = transport.listen("", "").await.unwrap();
        let endpoint = listener.endpoint().to_string();
        assert!(endpoint.starts_with("LRPC-"));

        let mut client = transport.connect("", &endpoint).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let transport = LocalTransport::new();
        assert!(matches!(
            transport.connect("", "no-such-endpoint").await,
            Err(RpcError::ServerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_endpoint_in_use_and_released() {
        let transport = LocalTransport::new();
        let listener = transport.listen("", "local-test-reuse").await.unwrap();
        assert!(matches!(
            transport.listen("", "local-test-reuse").await,
            Err(RpcError::EndpointInUse(_))
        ));
        drop(listener);
        assert!(transport.listen("", "local-test-reuse").await.is_ok());
    }

    #[tokio::test]
    async fn test_full_backlog_is_busy() {
        let transport = LocalTransport::with_backlog(1);
        let _listener = transport.listen("", "local-test-busy").await.unwrap();
        let _first = transport.connect("", "local-test-busy").await.unwrap();
        assert!(matches!(
            transport.connect("", "local-test-busy").await,
            Err(RpcError::ServerTooBusy)
        ));
    }
}
