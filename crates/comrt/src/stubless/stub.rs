use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::codec::{decode_values, encode_values};
use super::InterfaceDescriptor;
use crate::apartment::Apartment;
use crate::object::ComObject;
use crate::types::{hresult, ComError, Iid, Result};

/// Server-side receiver for one exported interface
#[async_trait]
pub trait InterfaceStub: Send + Sync {
    fn iid(&self) -> Iid;

    /// Unmarshal `args`, call the object and marshal the reply
    async fn invoke(&self, apartment: &Arc<Apartment>, method: u32, args: Bytes) -> Result<Bytes>;
}

/// Stub driven by an [`InterfaceDescriptor`]
pub struct StublessStub {
    descriptor: &'static InterfaceDescriptor,
    object: Weak<dyn ComObject>,
}

impl StublessStub {
    pub fn new(descriptor: &'static InterfaceDescriptor, object: Weak<dyn ComObject>) -> Self {
        Self { descriptor, object }
    }
}

#[async_trait]
impl InterfaceStub for StublessStub {
    fn iid(&self) -> Iid {
        self.descriptor.iid
    }

    async fn invoke(&self, apartment: &Arc<Apartment>, method: u32, args: Bytes) -> Result<Bytes> {
        let desc = self.descriptor.method(method)?;
        trace!(interface = self.descriptor.name, method = desc.name, "stub invoke");

        let object = self
            .object
            .upgrade()
            .ok_or(ComError::Fault(hresult::CO_E_OBJNOTCONNECTED))?;
        let ins = decode_values(apartment, desc.ins, args).await?;
        let outs = object.invoke(&self.descriptor.iid, method, ins).await?;
        Ok(encode_values(apartment, desc.outs, outs).await?.payload)
    }
}
