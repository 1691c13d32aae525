//! Process context for the object runtime
//!
//! [`ComRuntime`] owns the RPC runtime, the proxy/stub registry and every
//! apartment created through it. Creating one binds the endpoint all of its
//! apartments are reached on and starts serving IRemUnknown there.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rpcrt::{RpcRuntime, RuntimeConfig, SyntaxId};
use tracing::{debug, info, warn};

use crate::apartment::{object_interface, Apartment, ApartmentKind};
use crate::remunknown::{remunknown_interface, REMUNKNOWN_SYNTAX};
use crate::stubless::{InterfaceDescriptor, PsFactory, PsRegistry};
use crate::types::{iid, ComError, DualStringArray, Iid, Oxid, Result, StringBinding};

/// Object runtime configuration
#[derive(Debug, Clone)]
pub struct ComConfig {
    /// Protocol sequence apartments are exported on
    pub protseq: String,
    pub network_addr: String,
    /// Empty lets the transport pick one
    pub endpoint: String,
    /// References carried by a normal marshal
    pub normal_refs: u32,
    /// References asked for when an import arrives with none
    pub remote_addref_batch: u32,
    /// References asked for per interface on remote QueryInterface
    pub qi_public_refs: u32,
    /// Mark marshal records as not needing pings
    pub ping_free: bool,
    pub rpc: RuntimeConfig,
}

impl Default for ComConfig {
    fn default() -> Self {
        Self {
            protseq: rpcrt::protseq::NCALRPC.to_string(),
            network_addr: String::new(),
            endpoint: String::new(),
            normal_refs: 5,
            remote_addref_batch: 5,
            qi_public_refs: 1,
            ping_free: true,
            rpc: RuntimeConfig::default(),
        }
    }
}

impl ComConfig {
    pub fn with_protseq(mut self, protseq: &str, network_addr: &str, endpoint: &str) -> Self {
        self.protseq = protseq.to_string();
        self.network_addr = network_addr.to_string();
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn with_normal_refs(mut self, refs: u32) -> Self {
        self.normal_refs = refs;
        self
    }

    pub fn with_remote_addref_batch(mut self, refs: u32) -> Self {
        self.remote_addref_batch = refs.max(1);
        self
    }

    pub fn with_qi_public_refs(mut self, refs: u32) -> Self {
        self.qi_public_refs = refs;
        self
    }

    pub fn with_ping_free(mut self, ping_free: bool) -> Self {
        self.ping_free = ping_free;
        self
    }

    pub fn with_rpc(mut self, rpc: RuntimeConfig) -> Self {
        self.rpc = rpc;
        self
    }
}

/// State shared by every apartment of a runtime
pub(crate) struct Services {
    pub config: ComConfig,
    pub rpc: Arc<RpcRuntime>,
    pub ps: PsRegistry,
    /// How other runtimes reach this one
    pub bindings: DualStringArray,
    this: Weak<Services>,
    apartments: RwLock<HashMap<Oxid, Weak<Apartment>>>,
    /// IIDs with a dispatch interface registered on the RPC server
    served: tokio::sync::Mutex<HashSet<Iid>>,
}

impl Services {
    pub fn add_apartment(&self, apartment: &Arc<Apartment>) {
        self.apartments
            .write()
            .insert(apartment.oxid(), Arc::downgrade(apartment));
    }

    pub fn remove_apartment(&self, oxid: Oxid) {
        self.apartments.write().remove(&oxid);
    }

    /// Live apartment with this OXID
    pub fn apartment(&self, oxid: Oxid) -> Option<Arc<Apartment>> {
        self.apartments.read().get(&oxid).and_then(Weak::upgrade)
    }

    pub fn apartments(&self) -> Vec<Arc<Apartment>> {
        self.apartments
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Route inbound calls on `iid` to this runtime's apartments
    pub async fn ensure_served(&self, iid: Iid) -> Result<()> {
        if iid == iid::IUNKNOWN {
            return Ok(());
        }
        let mut served = self.served.lock().await;
        if served.contains(&iid) {
            return Ok(());
        }
        self.rpc
            .server()
            .register_interface(object_interface(self.this.clone(), iid))
            .await?;
        if let Err(e) = self
            .rpc
            .register_endpoints(SyntaxId::new(iid, 0, 0), &[], false)
            .await
        {
            warn!(%iid, error = %e, "could not publish interface endpoints");
        }
        served.insert(iid);
        debug!(%iid, "serving interface");
        Ok(())
    }
}

/// The object runtime of a process
pub struct ComRuntime {
    services: Arc<Services>,
    mta: Mutex<Option<Arc<Apartment>>>,
    stopped: AtomicBool,
}

impl ComRuntime {
    pub async fn new(config: ComConfig) -> Result<Self> {
        let rpc = RpcRuntime::new(config.rpc.clone());
        Self::with_rpc(config, rpc).await
    }

    /// Runtime on top of an existing RPC runtime
    pub async fn with_rpc(config: ComConfig, rpc: Arc<RpcRuntime>) -> Result<Self> {
        let key = rpc
            .server()
            .use_protseq_ep(&config.protseq, &config.network_addr, &config.endpoint)
            .await?;
        let transport = rpc.connector().transports().get(&key.protseq)?;
        let mut bindings = DualStringArray::new();
        bindings.add_string_binding(StringBinding::new(
            transport.tower_id(),
            &key.network_addr,
            &key.endpoint,
        ));

        let services = Arc::new_cyclic(|this| Services {
            config,
            rpc: rpc.clone(),
            ps: PsRegistry::new(),
            bindings,
            this: this.clone(),
            apartments: RwLock::new(HashMap::new()),
            served: tokio::sync::Mutex::new(HashSet::new()),
        });

        rpc.server()
            .register_interface(remunknown_interface(Arc::downgrade(&services)))
            .await?;
        if let Err(e) = rpc.register_endpoints(REMUNKNOWN_SYNTAX, &[], false).await {
            warn!(error = %e, "could not publish IRemUnknown endpoints");
        }
        info!(%key, "object runtime started");

        Ok(Self {
            services,
            mta: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ComConfig {
        &self.services.config
    }

    pub fn rpc(&self) -> &Arc<RpcRuntime> {
        &self.services.rpc
    }

    /// String bindings written into every marshal record
    pub fn bindings(&self) -> &DualStringArray {
        &self.services.bindings
    }

    /// Register the table-driven proxy and stub for an interface
    pub fn register_interface(&self, descriptor: &'static InterfaceDescriptor) {
        self.services.ps.register_interface(descriptor);
    }

    pub fn register_factory(&self, factory: Arc<dyn PsFactory>) {
        self.services.ps.register(factory);
    }

    /// A new STA, or the process-wide MTA
    pub fn init_apartment(&self, kind: ApartmentKind) -> Result<Arc<Apartment>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ComError::NotInitialized);
        }
        match kind {
            ApartmentKind::Sta => Ok(Apartment::new(ApartmentKind::Sta, self.services.clone())),
            ApartmentKind::Mta => Ok(self.mta()),
        }
    }

    /// The multithreaded apartment, created on first use
    pub fn mta(&self) -> Arc<Apartment> {
        let mut mta = self.mta.lock();
        match mta.as_ref() {
            Some(apartment) if apartment.is_initialized() => apartment.clone(),
            _ => {
                let apartment = Apartment::new(ApartmentKind::Mta, self.services.clone());
                *mta = Some(apartment.clone());
                apartment
            }
        }
    }

    /// Live apartment with this OXID
    pub fn apartment(&self, oxid: Oxid) -> Option<Arc<Apartment>> {
        self.services.apartment(oxid)
    }

    pub fn apartments(&self) -> Vec<Arc<Apartment>> {
        self.services.apartments()
    }

    pub async fn uninitialize(&self, apartment: &Arc<Apartment>) {
        apartment.uninitialize().await;
        let mut mta = self.mta.lock();
        if mta.as_ref().is_some_and(|m| Arc::ptr_eq(m, apartment)) {
            *mta = None;
        }
    }

    /// Uninitialize every apartment and stop serving
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for apartment in self.services.apartments() {
            apartment.uninitialize().await;
        }
        self.mta.lock().take();

        let served: Vec<Iid> = self.services.served.lock().await.drain().collect();
        let server = self.services.rpc.server();
        for iid in served.iter().copied().chain(std::iter::once(iid::IREMUNKNOWN)) {
            if let Err(e) = server.unregister_interface(&iid).await {
                debug!(%iid, error = %e, "unregister at shutdown");
            }
            let _ = self
                .services
                .rpc
                .unregister_endpoints(SyntaxId::new(iid, 0, 0), &[])
                .await;
        }
        info!("object runtime stopped");
    }
}

impl std::fmt::Debug for ComRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComRuntime")
            .field("bindings", &self.services.bindings)
            .field("apartments", &self.services.apartments.read().len())
            .finish()
    }
}
