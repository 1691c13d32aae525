//! Loopback TCP transport (`ncacn_ip_tcp`)

use std::io::ErrorKind;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{protseq, tower_id, BoxedStream, Listener, Transport};
use crate::error::{Result, RpcError};

const DEFAULT_HOST: &str = "127.0.0.1";

fn host(network_addr: &str) -> &str {
    if network_addr.is_empty() {
        DEFAULT_HOST
    } else {
        network_addr
    }
}

fn port(endpoint: &str) -> Result<u16> {
    if endpoint.is_empty() {
        return Ok(0);
    }
    endpoint
        .parse()
        .map_err(|_| RpcError::InvalidBinding(format!("bad tcp endpoint: {}", endpoint)))
}

/// TCP transport
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn protseq(&self) -> &'static str {
        protseq::NCACN_IP_TCP
    }

    fn tower_id(&self) -> u16 {
        tower_id::NCACN_IP_TCP
    }

    async fn listen(&self, network_addr: &str, endpoint: &str) -> Result<Box<dyn Listener>> {
        let host = host(network_addr).to_string();
        let listener = TcpListener::bind((host.as_str(), port(endpoint)?))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AddrInUse => RpcError::EndpointInUse(endpoint.to_string()),
                _ => RpcError::Io(e),
            })?;
        let endpoint = listener.local_addr()?.port().to_string();
        debug!(%host, %endpoint, "tcp endpoint listening");
        Ok(Box::new(TcpEndpoint {
            host,
            endpoint,
            listener,
        }))
    }

    async fn connect(&self, network_addr: &str, endpoint: &str) -> Result<BoxedStream> {
        let host = host(network_addr);
        let stream = TcpStream::connect((host, port(endpoint)?))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::ConnectionRefused => {
                    RpcError::ServerUnavailable(format!("ncacn_ip_tcp:{}[{}]", host, endpoint))
                }
                _ => RpcError::Io(e),
            })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

struct TcpEndpoint {
    host: String,
    endpoint: String,
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpEndpoint {
    fn network_addr(&self) -> &str {
        &self.host
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn accept(&mut self) -> Result<BoxedStream> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "tcp connection accepted");
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
