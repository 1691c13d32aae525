//! In-memory endpoint directory and its RPC interface

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::debug;

use super::{
    epm_op, objects_or_nil, put_string, EndpointBinding, EndpointDirectory, RegistrationRequest,
    ResolveRequest, EPM_INTERFACE,
};
use crate::error::{Result, RpcError};
use crate::interface::{Interface, InterfaceBuilder};
use crate::uuid::{SyntaxId, Uuid};

/// One registered endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpmEntry {
    pub interface: SyntaxId,
    pub object: Uuid,
    pub protseq: String,
    pub endpoint: String,
}

impl EpmEntry {
    /// Same interface major version, at least the requested minor version
    fn serves(&self, interface: &SyntaxId) -> bool {
        self.interface.uuid == interface.uuid
            && self.interface.major() == interface.major()
            && self.interface.minor() >= interface.minor()
    }
}

/// Endpoint registrations, keyed by interface UUID
#[derive(Debug, Default)]
pub struct EpmRegistry {
    entries: RwLock<HashMap<Uuid, Vec<EpmEntry>>>,
}

impl EpmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Without `no_replace`, entries for the same interface
    /// version, object and protocol sequence are replaced.
    pub fn insert(&self, entry: EpmEntry, no_replace: bool) {
        debug!(
            interface = %entry.interface,
            object = %entry.object,
            protseq = %entry.protseq,
            endpoint = %entry.endpoint,
            "registering endpoint"
        );
        let mut entries = self.entries.write();
        let list = entries.entry(entry.interface.uuid).or_default();
        if no_replace {
            if !list.contains(&entry) {
                list.push(entry);
            }
            return;
        }
        list.retain(|e| {
            !(e.interface.major() == entry.interface.major()
                && e.object == entry.object
                && e.protseq == entry.protseq)
        });
        list.push(entry);
    }

    /// Remove a specific entry
    pub fn delete_entry(&self, entry: &EpmEntry) -> bool {
        let mut entries = self.entries.write();
        let Some(list) = entries.get_mut(&entry.interface.uuid) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| {
            !(e.interface.major() == entry.interface.major()
                && e.object == entry.object
                && e.protseq == entry.protseq
                && e.endpoint == entry.endpoint)
        });
        let removed = list.len() < before;
        if list.is_empty() {
            entries.remove(&entry.interface.uuid);
        }
        removed
    }

    /// Entries registered for an interface
    pub fn lookup(&self, interface_uuid: &Uuid) -> Vec<EpmEntry> {
        self.entries
            .read()
            .get(interface_uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Endpoint for `object` over `protseq`. An entry for the exact object
    /// wins over one registered for the nil object.
    pub fn map(&self, interface: &SyntaxId, object: &Uuid, protseq: &str) -> Option<String> {
        let entries = self.entries.read();
        let list = entries.get(&interface.uuid)?;
        let candidates = || list.iter().filter(|e| e.serves(interface) && e.protseq == protseq);
        candidates()
            .find(|e| e.object == *object)
            .or_else(|| candidates().find(|e| e.object.is_nil()))
            .map(|e| e.endpoint.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn entries_for(
        interface: SyntaxId,
        objects: &[Uuid],
        bindings: &[EndpointBinding],
    ) -> impl Iterator<Item = EpmEntry> {
        let objects = objects_or_nil(objects);
        let bindings = bindings.to_vec();
        objects.into_iter().flat_map(move |object| {
            bindings.clone().into_iter().map(move |b| EpmEntry {
                interface,
                object,
                protseq: b.protseq,
                endpoint: b.endpoint,
            })
        })
    }
}

#[async_trait]
impl EndpointDirectory for EpmRegistry {
    async fn register(
        &self,
        interface: SyntaxId,
        objects: &[Uuid],
        bindings: &[EndpointBinding],
        no_replace: bool,
    ) -> Result<()> {
        for entry in Self::entries_for(interface, objects, bindings) {
            self.insert(entry, no_replace);
        }
        Ok(())
    }

    async fn unregister(
        &self,
        interface: SyntaxId,
        objects: &[Uuid],
        bindings: &[EndpointBinding],
    ) -> Result<()> {
        let mut removed = false;
        for entry in Self::entries_for(interface, objects, bindings) {
            removed |= self.delete_entry(&entry);
        }
        if removed {
            Ok(())
        } else {
            Err(RpcError::EptNotRegistered(interface.to_string()))
        }
    }

    async fn resolve(&self, interface: SyntaxId, object: Uuid, protseq: &str) -> Result<String> {
        self.map(&interface, &object, protseq)
            .ok_or_else(|| RpcError::EptNotRegistered(interface.to_string()))
    }
}

/// Serve `registry` as the directory interface
pub fn epm_interface(registry: Arc<EpmRegistry>) -> Interface {
    let reg_register = Arc::clone(&registry);
    let reg_unregister = Arc::clone(&registry);
    let reg_resolve = Arc::clone(&registry);

    InterfaceBuilder::from_syntax(EPM_INTERFACE)
        .operation(epm_op::REGISTER, move |args: Bytes| {
            let reg = Arc::clone(&reg_register);
            async move { process_register(&reg, args).await }
        })
        .operation(epm_op::UNREGISTER, move |args: Bytes| {
            let reg = Arc::clone(&reg_unregister);
            async move { process_unregister(&reg, args).await }
        })
        .operation(epm_op::RESOLVE, move |args: Bytes| {
            let reg = Arc::clone(&reg_resolve);
            async move { process_resolve(&reg, args).await }
        })
        .build()
}

async fn process_register(registry: &EpmRegistry, mut args: Bytes) -> Result<Bytes> {
    let request = RegistrationRequest::decode(&mut args)?;
    registry
        .register(
            request.interface,
            &request.objects,
            &request.bindings,
            request.no_replace,
        )
        .await?;
    Ok(Bytes::new())
}

async fn process_unregister(registry: &EpmRegistry, mut args: Bytes) -> Result<Bytes> {
    let request = RegistrationRequest::decode(&mut args)?;
    registry
        .unregister(request.interface, &request.objects, &request.bindings)
        .await?;
    Ok(Bytes::new())
}

async fn process_resolve(registry: &EpmRegistry, mut args: Bytes) -> Result<Bytes> {
    let request = ResolveRequest::decode(&mut args)?;
    let endpoint = registry
        .resolve(request.interface, request.object, &request.protseq)
        .await?;
    let mut out = BytesMut::with_capacity(4 + endpoint.len());
    put_string(&mut out, &endpoint);
    Ok(out.freeze())
}
