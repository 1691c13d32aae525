//! Process-level RPC context
//!
//! [`RpcRuntime`] bundles the pieces a process needs to both make and serve
//! calls: the connector and its connection cache, the shared worker pool, the
//! server, and an endpoint directory.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::binding::Binding;
use crate::connection::{ConnectionKey, Connector};
use crate::epm::{
    epm_interface, resolve_binding, EndpointBinding, EndpointDirectory, EpmClient, EpmRegistry,
};
use crate::error::Result;
use crate::message::{self, RpcMessage};
use crate::server::{RpcServer, ServerConfig};
use crate::transport::TransportRegistry;
use crate::uuid::{SyntaxId, Uuid};
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// Where the endpoint directory lives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DirectoryConfig {
    /// An in-process registry owned by the runtime
    #[default]
    Local,
    /// A registry hosted by another runtime
    Remote {
        protseq: String,
        network_addr: String,
        endpoint: String,
    },
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub server: ServerConfig,
    pub worker_pool: WorkerPoolConfig,
    /// Connect attempts made while an endpoint reports busy
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    pub directory: DirectoryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            connect_retries: 10,
            connect_retry_delay: Duration::from_millis(10),
            directory: DirectoryConfig::Local,
        }
    }
}

impl RuntimeConfig {
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn with_worker_pool(mut self, worker_pool: WorkerPoolConfig) -> Self {
        self.worker_pool = worker_pool;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_retry_delay = delay;
        self
    }

    pub fn with_directory(mut self, directory: DirectoryConfig) -> Self {
        self.directory = directory;
        self
    }
}

/// Client and server halves of the RPC runtime
pub struct RpcRuntime {
    config: RuntimeConfig,
    connector: Arc<Connector>,
    pool: WorkerPool,
    server: Arc<RpcServer>,
    directory: Arc<dyn EndpointDirectory>,
    registry: Option<Arc<EpmRegistry>>,
}

impl RpcRuntime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_transports(config, TransportRegistry::default())
    }

    pub fn with_transports(config: RuntimeConfig, transports: TransportRegistry) -> Arc<Self> {
        let connector = Arc::new(
            Connector::new(
                transports.clone(),
                config.connect_retries,
                config.connect_retry_delay,
            )
            .with_max_payload(config.server.max_payload_size),
        );
        let pool = WorkerPool::new(config.worker_pool.clone());
        let server = RpcServer::new(config.server.clone(), transports, pool.clone());

        let (directory, registry): (Arc<dyn EndpointDirectory>, _) = match &config.directory {
            DirectoryConfig::Local => {
                let registry = Arc::new(EpmRegistry::new());
                (registry.clone(), Some(registry))
            }
            DirectoryConfig::Remote {
                protseq,
                network_addr,
                endpoint,
            } => (
                Arc::new(EpmClient::new(connector.clone(), protseq, network_addr, endpoint)),
                None,
            ),
        };

        Arc::new(Self {
            config,
            connector,
            pool,
            server,
            directory,
            registry,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    pub fn directory(&self) -> &Arc<dyn EndpointDirectory> {
        &self.directory
    }

    /// The in-process registry, when the directory is local
    pub fn registry(&self) -> Option<&Arc<EpmRegistry>> {
        self.registry.as_ref()
    }

    /// Serve the local registry to other runtimes on `protseq`/`endpoint`
    pub async fn host_directory(&self, protseq: &str, network_addr: &str, endpoint: &str) -> Result<ConnectionKey> {
        let registry = self.registry.clone().ok_or_else(|| {
            crate::error::RpcError::InvalidBinding("runtime uses a remote directory".into())
        })?;
        let key = self.server.use_protseq_ep(protseq, network_addr, endpoint).await?;
        if !self.server.is_registered(&crate::epm::EPM_INTERFACE.uuid) {
            self.server.register_interface(epm_interface(registry)).await?;
        }
        info!(%key, "hosting endpoint directory");
        Ok(key)
    }

    /// Publish every server endpoint for `interface` in the directory
    pub async fn register_endpoints(&self, interface: SyntaxId, objects: &[Uuid], no_replace: bool) -> Result<()> {
        let bindings: Vec<EndpointBinding> = self
            .server
            .endpoints()
            .into_iter()
            .map(|key| EndpointBinding::new(&key.protseq, &key.endpoint))
            .collect();
        self.directory
            .register(interface, objects, &bindings, no_replace)
            .await
    }

    pub async fn unregister_endpoints(&self, interface: SyntaxId, objects: &[Uuid]) -> Result<()> {
        let bindings: Vec<EndpointBinding> = self
            .server
            .endpoints()
            .into_iter()
            .map(|key| EndpointBinding::new(&key.protseq, &key.endpoint))
            .collect();
        self.directory.unregister(interface, objects, &bindings).await
    }

    /// Prepare a call: resolve the binding's endpoint if needed and allocate
    /// a request buffer of `size` bytes
    pub async fn get_buffer(
        &self,
        binding: &Binding,
        interface: SyntaxId,
        opnum: u16,
        size: usize,
    ) -> Result<RpcMessage> {
        if !binding.is_resolved() {
            debug!(%interface, "resolving endpoint for unbound call");
            resolve_binding(self.directory.as_ref(), binding, interface).await?;
        }
        Ok(RpcMessage::new(interface, opnum, size))
    }

    pub async fn send(&self, binding: &Binding, msg: &mut RpcMessage) -> Result<()> {
        message::send(&self.connector, binding, msg).await
    }

    pub async fn receive(&self, binding: &Binding, msg: &mut RpcMessage) -> Result<Bytes> {
        message::receive(&self.connector, binding, msg).await
    }

    pub async fn send_and_receive(&self, binding: &Binding, msg: &mut RpcMessage) -> Result<Bytes> {
        message::send_and_receive(&self.connector, binding, msg).await
    }

    pub fn free_buffer(&self, binding: &Binding, msg: &mut RpcMessage) {
        message::free_buffer(&self.connector, binding, msg)
    }
}
