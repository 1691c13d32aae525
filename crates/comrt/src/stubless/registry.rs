use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use super::{InterfaceDescriptor, InterfaceProxy, InterfaceStub, StublessProxy, StublessStub};
use crate::channel::ClientChannel;
use crate::object::ComObject;
use crate::types::{Iid, Ipid};

/// Creates the stub and proxy for one interface
pub trait PsFactory: Send + Sync {
    fn iid(&self) -> Iid;

    /// The stub must not keep `object` alive
    fn create_stub(&self, object: Weak<dyn ComObject>) -> Arc<dyn InterfaceStub>;

    fn create_proxy(&self, ipid: Ipid, channel: Arc<ClientChannel>) -> Arc<dyn InterfaceProxy>;
}

/// Factory for descriptor-driven proxies and stubs
pub struct StublessFactory {
    descriptor: &'static InterfaceDescriptor,
}

impl StublessFactory {
    pub fn new(descriptor: &'static InterfaceDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &'static InterfaceDescriptor {
        self.descriptor
    }
}

impl PsFactory for StublessFactory {
    fn iid(&self) -> Iid {
        self.descriptor.iid
    }

    fn create_stub(&self, object: Weak<dyn ComObject>) -> Arc<dyn InterfaceStub> {
        Arc::new(StublessStub::new(self.descriptor, object))
    }

    fn create_proxy(&self, ipid: Ipid, channel: Arc<ClientChannel>) -> Arc<dyn InterfaceProxy> {
        Arc::new(StublessProxy::new(self.descriptor, ipid, channel))
    }
}

/// Proxy/stub factories by IID
#[derive(Default)]
pub struct PsRegistry {
    factories: RwLock<HashMap<Iid, Arc<dyn PsFactory>>>,
}

impl PsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for the same IID
    pub fn register(&self, factory: Arc<dyn PsFactory>) {
        let iid = factory.iid();
        if self.factories.write().insert(iid, factory).is_some() {
            debug!(%iid, "replaced proxy/stub factory");
        }
    }

    pub fn register_interface(&self, descriptor: &'static InterfaceDescriptor) {
        self.register(Arc::new(StublessFactory::new(descriptor)));
    }

    pub fn get(&self, iid: &Iid) -> Option<Arc<dyn PsFactory>> {
        self.factories.read().get(iid).cloned()
    }

    pub fn contains(&self, iid: &Iid) -> bool {
        self.factories.read().contains_key(iid)
    }
}
