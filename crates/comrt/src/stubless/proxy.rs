use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::codec::{decode_values, encode_values};
use super::InterfaceDescriptor;
use crate::apartment::Apartment;
use crate::channel::ClientChannel;
use crate::object::Value;
use crate::types::{ComError, Iid, Ipid, Result};

/// Client-side forwarder for one imported interface
#[async_trait]
pub trait InterfaceProxy: Send + Sync {
    fn iid(&self) -> Iid;

    async fn invoke(&self, apartment: &Arc<Apartment>, method: u32, args: Vec<Value>) -> Result<Vec<Value>>;
}

/// Proxy driven by an [`InterfaceDescriptor`]
pub struct StublessProxy {
    descriptor: &'static InterfaceDescriptor,
    ipid: Ipid,
    channel: Arc<ClientChannel>,
}

impl StublessProxy {
    pub fn new(descriptor: &'static InterfaceDescriptor, ipid: Ipid, channel: Arc<ClientChannel>) -> Self {
        Self {
            descriptor,
            ipid,
            channel,
        }
    }

    pub fn ipid(&self) -> Ipid {
        self.ipid
    }
}

#[async_trait]
impl InterfaceProxy for StublessProxy {
    fn iid(&self) -> Iid {
        self.descriptor.iid
    }

    async fn invoke(&self, apartment: &Arc<Apartment>, method: u32, args: Vec<Value>) -> Result<Vec<Value>> {
        let desc = self.descriptor.method(method)?;
        trace!(interface = self.descriptor.name, method = desc.name, ipid = %self.ipid, "proxy invoke");

        let request = encode_values(apartment, desc.ins, args).await?;
        match self
            .channel
            .call(self.ipid, self.descriptor.iid, method, request.payload.clone())
            .await
        {
            Ok(reply) => decode_values(apartment, desc.outs, reply).await,
            // a fault means the stub ran and owns whatever it unmarshaled
            Err(e @ ComError::Fault(_)) => Err(e),
            Err(e) => {
                request.release(apartment).await;
                Err(e)
            }
        }
    }
}
