//! Endpoint directory
//!
//! Maps (interface, object) pairs to the endpoint serving them for each
//! protocol sequence. Servers register the endpoints they listen on; clients
//! holding a binding without an endpoint resolve it before the first call.
//!
//! [`EpmRegistry`] is the directory table itself and can be used in-process or
//! hosted as an RPC interface with [`epm_interface`]. [`EpmClient`] talks to a
//! hosted registry.

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use tracing::debug;

use crate::binding::Binding;
use crate::error::{Result, RpcError};
use crate::uuid::{SyntaxId, Uuid};

mod client;
mod registry;

pub use client::EpmClient;
pub use registry::{epm_interface, EpmEntry, EpmRegistry};

/// Directory interface identifier
pub const EPM_INTERFACE: SyntaxId = SyntaxId::new(
    Uuid::from_u128(0xe1af8308_5d1f_11c9_91a4_08002b14a0fa),
    3,
    0,
);

/// Well-known directory endpoints
pub const EPM_LOCAL_ENDPOINT: &str = "epmapper";
pub const EPM_TCP_ENDPOINT: &str = "135";

/// Directory operations
pub mod epm_op {
    pub const REGISTER: u16 = 0;
    pub const UNREGISTER: u16 = 1;
    pub const RESOLVE: u16 = 2;
}

/// One (protocol sequence, endpoint) pair a server is reachable on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointBinding {
    pub protseq: String,
    pub endpoint: String,
}

impl EndpointBinding {
    pub fn new(protseq: &str, endpoint: &str) -> Self {
        Self {
            protseq: protseq.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

/// Endpoint directory operations
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    /// Register `interface` on `bindings` for each of `objects` (nil object if
    /// empty). Replaces earlier registrations for the same interface, object
    /// and protocol sequence unless `no_replace` is set.
    async fn register(
        &self,
        interface: SyntaxId,
        objects: &[Uuid],
        bindings: &[EndpointBinding],
        no_replace: bool,
    ) -> Result<()>;

    async fn unregister(
        &self,
        interface: SyntaxId,
        objects: &[Uuid],
        bindings: &[EndpointBinding],
    ) -> Result<()>;

    /// Endpoint serving `interface` for `object` over `protseq`
    async fn resolve(&self, interface: SyntaxId, object: Uuid, protseq: &str) -> Result<String>;
}

/// Fill in a binding's endpoint from the directory. Bindings that already
/// have an endpoint are left alone.
pub async fn resolve_binding(
    directory: &dyn EndpointDirectory,
    binding: &Binding,
    interface: SyntaxId,
) -> Result<()> {
    if binding.is_resolved() {
        return Ok(());
    }
    let endpoint = directory
        .resolve(interface, binding.object(), binding.protseq())
        .await?;
    debug!(%interface, %endpoint, "resolved binding endpoint");
    binding.set_endpoint(&endpoint);
    Ok(())
}

fn objects_or_nil(objects: &[Uuid]) -> Vec<Uuid> {
    if objects.is_empty() {
        vec![Uuid::NIL]
    } else {
        objects.to_vec()
    }
}

// Request/response encoding shared by the hosted registry and its client.
// Everything is little-endian; strings are a u32 byte count plus UTF-8.

pub(crate) fn put_string<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_string<B: Buf>(buf: &mut B) -> Result<String> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(RpcError::ShortRead {
            needed: len,
            have: buf.remaining(),
        });
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| RpcError::Protocol("string is not UTF-8".into()))
}

pub(crate) fn get_u32<B: Buf>(buf: &mut B) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(RpcError::ShortRead {
            needed: 4,
            have: buf.remaining(),
        });
    }
    Ok(buf.get_u32_le())
}

/// Body of register/unregister requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegistrationRequest {
    pub interface: SyntaxId,
    pub objects: Vec<Uuid>,
    pub bindings: Vec<EndpointBinding>,
    pub no_replace: bool,
}

impl RegistrationRequest {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.interface.uuid.encode(buf, true);
        buf.put_u32_le(self.interface.version);
        buf.put_u32_le(self.objects.len() as u32);
        for object in &self.objects {
            object.encode(buf, true);
        }
        buf.put_u32_le(self.bindings.len() as u32);
        for binding in &self.bindings {
            put_string(buf, &binding.protseq);
            put_string(buf, &binding.endpoint);
        }
        buf.put_u32_le(self.no_replace as u32);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let uuid = Uuid::decode(buf, true)?;
        let version = get_u32(buf)?;
        let n_objects = get_u32(buf)? as usize;
        let mut objects = Vec::with_capacity(n_objects.min(64));
        for _ in 0..n_objects {
            objects.push(Uuid::decode(buf, true)?);
        }
        let n_bindings = get_u32(buf)? as usize;
        let mut bindings = Vec::with_capacity(n_bindings.min(64));
        for _ in 0..n_bindings {
            let protseq = get_string(buf)?;
            let endpoint = get_string(buf)?;
            bindings.push(EndpointBinding { protseq, endpoint });
        }
        let no_replace = get_u32(buf)? != 0;
        Ok(Self {
            interface: SyntaxId { uuid, version },
            objects,
            bindings,
            no_replace,
        })
    }
}

/// Body of a resolve request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolveRequest {
    pub interface: SyntaxId,
    pub object: Uuid,
    pub protseq: String,
}

impl ResolveRequest {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.interface.uuid.encode(buf, true);
        buf.put_u32_le(self.interface.version);
        self.object.encode(buf, true);
        put_string(buf, &self.protseq);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let uuid = Uuid::decode(buf, true)?;
        let version = get_u32(buf)?;
        let object = Uuid::decode(buf, true)?;
        let protseq = get_string(buf)?;
        Ok(Self {
            interface: SyntaxId { uuid, version },
            object,
            protseq,
        })
    }
}
