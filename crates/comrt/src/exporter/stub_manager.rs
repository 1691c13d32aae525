//! Stub manager: the export side of an apartment
//!
//! Every object marshaled out of an apartment gets one [`ExportedObject`]
//! entry holding the object, its OID and one [`ExportedInterface`] per IID
//! handed out. External references are counted per interface; the object's
//! aggregate count is the sum over its interfaces and the entry is destroyed
//! when a release brings it to zero.
//!
//! The entry only points at the object weakly. It holds a strong reference
//! while external references are outstanding, so an object marshaled
//! table-weak and nothing else stays destructible. Table-weak marshals are
//! counted separately and never keep an entry alive; an entry whose object
//! has died with only table-weak marshals outstanding is pruned.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use crate::apartment::Apartment;
use crate::object::{ComObject, InterfacePtr};
use crate::stubless::{InterfaceStub, PsFactory};
use crate::types::{iid, ComError, Iid, Ipid, Oid, Oxid, Result, StdObjRef};

pub(crate) fn identity_of(object: &Arc<dyn ComObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// One interface of an exported object
pub(crate) struct ExportedInterface {
    pub iid: Iid,
    pub ipid: Ipid,
    pub refs: u32,
    /// None for IUnknown, whose calls never reach a stub
    pub stub: Option<Arc<dyn InterfaceStub>>,
}

/// One exported object
pub(crate) struct ExportedObject {
    pub oid: Oid,
    pub identity: usize,
    object: Weak<dyn ComObject>,
    /// Strong reference taken while `refs > 0`
    hold: Option<Arc<dyn ComObject>>,
    next_counter: u32,
    pub interfaces: Vec<ExportedInterface>,
    pub refs: u32,
    pub weak_refs: u32,
}

impl ExportedObject {
    fn new(oxid: Oxid, oid: Oid, object: &Arc<dyn ComObject>) -> Self {
        Self {
            oid,
            identity: identity_of(object),
            object: Arc::downgrade(object),
            hold: None,
            next_counter: 1,
            interfaces: vec![ExportedInterface {
                iid: iid::IUNKNOWN,
                ipid: Ipid::derive(oxid, oid, 0),
                refs: 0,
                stub: None,
            }],
            refs: 0,
            weak_refs: 0,
        }
    }

    /// The object, if anything still holds it
    pub fn object(&self) -> Option<Arc<dyn ComObject>> {
        self.object.upgrade()
    }

    fn is_dead(&self) -> bool {
        self.refs == 0 && self.object.strong_count() == 0
    }

    /// Take the strong hold before handing out the first reference
    fn take_hold(&mut self) -> Result<()> {
        if self.hold.is_none() {
            let object = self.object().ok_or_else(|| ComError::ObjectNotConnected(self.interfaces[0].ipid))?;
            self.hold = Some(object);
        }
        Ok(())
    }

    pub fn find_iid(&self, iid: &Iid) -> Option<&ExportedInterface> {
        self.interfaces.iter().find(|i| i.iid == *iid)
    }

    pub fn find_ipid(&self, ipid: &Ipid) -> Option<&ExportedInterface> {
        self.interfaces.iter().find(|i| i.ipid == *ipid)
    }

    fn find_ipid_mut(&mut self, ipid: &Ipid) -> Option<&mut ExportedInterface> {
        self.interfaces.iter_mut().find(|i| i.ipid == *ipid)
    }
}

/// Exported objects indexed by identity, OID and IPID
#[derive(Default)]
pub(crate) struct ExportTable {
    by_identity: HashMap<usize, Oid>,
    objects: HashMap<Oid, ExportedObject>,
    ipids: HashMap<Ipid, Oid>,
}

impl ExportTable {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn oid_of(&self, identity: usize) -> Option<Oid> {
        self.by_identity.get(&identity).copied()
    }

    pub fn get(&self, oid: &Oid) -> Option<&ExportedObject> {
        self.objects.get(oid)
    }

    pub fn owner(&self, ipid: &Ipid) -> Option<&ExportedObject> {
        self.ipids.get(ipid).and_then(|oid| self.objects.get(oid))
    }

    fn owner_mut(&mut self, ipid: &Ipid) -> Option<&mut ExportedObject> {
        let oid = self.ipids.get(ipid)?;
        self.objects.get_mut(oid)
    }

    fn insert(&mut self, entry: ExportedObject) {
        self.by_identity.insert(entry.identity, entry.oid);
        for interface in &entry.interfaces {
            self.ipids.insert(interface.ipid, entry.oid);
        }
        self.objects.insert(entry.oid, entry);
    }

    /// Find or create the interface entry for `iid` on `oid`
    fn ensure_interface(
        &mut self,
        oxid: Oxid,
        oid: Oid,
        iid: Iid,
        factory: Option<&Arc<dyn PsFactory>>,
    ) -> Result<Ipid> {
        let entry = self.objects.get_mut(&oid).ok_or_else(|| {
            ComError::ObjectNotConnected(Ipid::derive(oxid, oid, 0))
        })?;
        if let Some(existing) = entry.find_iid(&iid) {
            return Ok(existing.ipid);
        }
        let factory = factory.ok_or(ComError::NoInterface(iid))?;

        let ipid = Ipid::derive(oxid, oid, entry.next_counter);
        entry.next_counter += 1;
        entry.interfaces.push(ExportedInterface {
            iid,
            ipid,
            refs: 0,
            stub: Some(factory.create_stub(Weak::clone(&entry.object))),
        });
        self.ipids.insert(ipid, oid);
        trace!(%oid, %iid, %ipid, "exported interface");
        Ok(ipid)
    }

    pub fn remove(&mut self, oid: &Oid) -> Option<ExportedObject> {
        let entry = self.objects.remove(oid)?;
        self.by_identity.remove(&entry.identity);
        for interface in &entry.interfaces {
            self.ipids.remove(&interface.ipid);
        }
        Some(entry)
    }

    /// Drop entries whose object died while only table-weak marshals
    /// referred to it
    fn prune(&mut self) {
        let dead: Vec<Oid> = self.objects.values().filter(|e| e.is_dead()).map(|e| e.oid).collect();
        for oid in dead {
            if let Some(entry) = self.remove(&oid) {
                debug!(%oid, weak_refs = entry.weak_refs, "pruned export of destroyed object");
            }
        }
    }

    pub fn drain(&mut self) -> Vec<ExportedObject> {
        self.by_identity.clear();
        self.ipids.clear();
        self.objects.drain().map(|(_, entry)| entry).collect()
    }
}

impl Apartment {
    /// Stub factory for `iid`, after checking the object implements it and
    /// making sure calls on it are routed here. None for IUnknown.
    async fn prepare_interface(
        &self,
        object: &Arc<dyn ComObject>,
        iid: Iid,
    ) -> Result<Option<Arc<dyn PsFactory>>> {
        if iid == iid::IUNKNOWN {
            return Ok(None);
        }
        if !object.implements(&iid) {
            return Err(ComError::NoInterface(iid));
        }
        let factory = self.services.ps.get(&iid).ok_or(ComError::NoInterface(iid))?;
        self.services.ensure_served(iid).await?;
        Ok(Some(factory))
    }

    /// Export `object` through `iid` without handing out references
    pub async fn export(&self, object: &Arc<dyn ComObject>, iid: Iid) -> Result<(Oid, Ipid)> {
        self.export_with_refs(object, iid, 0, 0).await
    }

    /// Export and take `refs` external and `weak_refs` table-weak references
    /// in one step
    pub(crate) async fn export_with_refs(
        &self,
        object: &Arc<dyn ComObject>,
        iid: Iid,
        refs: u32,
        weak_refs: u32,
    ) -> Result<(Oid, Ipid)> {
        self.check_initialized()?;
        let factory = self.prepare_interface(object, iid).await?;

        let mut tables = self.tables.lock();
        let exports = &mut tables.exports;
        exports.prune();
        let oid = match exports.oid_of(identity_of(object)) {
            Some(oid) => oid,
            None => {
                let oid = Oid(self.next_oid.fetch_add(1, Ordering::Relaxed));
                exports.insert(ExportedObject::new(self.oxid(), oid, object));
                debug!(oxid = %self.oxid(), %oid, "exported object");
                oid
            }
        };
        let ipid = exports.ensure_interface(self.oxid(), oid, iid, factory.as_ref())?;
        if let Some(entry) = exports.objects.get_mut(&oid) {
            if refs > 0 && entry.hold.is_none() {
                entry.hold = Some(object.clone());
            }
            entry.weak_refs += weak_refs;
            entry.refs += refs;
            if let Some(interface) = entry.find_ipid_mut(&ipid) {
                interface.refs += refs;
            }
        }
        Ok((oid, ipid))
    }

    /// Export another interface of the object owning `ipid` and take `refs`
    /// references on it. Fails if that object is no longer exported.
    pub(crate) async fn export_sibling(&self, ipid: Ipid, iid: Iid, refs: u32) -> Result<StdObjRef> {
        let (oid, object) = {
            let tables = self.tables.lock();
            let entry = tables.exports.owner(&ipid).ok_or(ComError::ObjectNotConnected(ipid))?;
            (entry.oid, entry.object().ok_or(ComError::ObjectNotConnected(ipid))?)
        };
        let factory = self.prepare_interface(&object, iid).await?;

        let mut tables = self.tables.lock();
        let new_ipid = tables
            .exports
            .ensure_interface(self.oxid(), oid, iid, factory.as_ref())
            .map_err(|e| match e {
                ComError::ObjectNotConnected(_) => ComError::ObjectNotConnected(ipid),
                e => e,
            })?;
        add_refs(&mut tables.exports, &new_ipid, refs)?;
        Ok(StdObjRef::new(self.oxid(), oid, new_ipid, refs))
    }

    /// Add `n` external references to an exported interface
    pub fn add_external_refs(&self, ipid: Ipid, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let mut tables = self.tables.lock();
        add_refs(&mut tables.exports, &ipid, n)
    }

    /// Drop `n` external references. The object entry is destroyed when its
    /// aggregate count reaches zero.
    pub fn release_external_refs(&self, ipid: Ipid, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let removed = {
            let mut tables = self.tables.lock();
            let exports = &mut tables.exports;
            let entry = exports.owner_mut(&ipid).ok_or(ComError::ObjectNotConnected(ipid))?;
            let interface = entry
                .find_ipid_mut(&ipid)
                .ok_or(ComError::ObjectNotConnected(ipid))?;

            let n = if n > interface.refs {
                warn!(%ipid, held = interface.refs, requested = n, "release exceeds held references");
                interface.refs
            } else {
                n
            };
            interface.refs -= n;
            entry.refs -= n;
            trace!(%ipid, remaining = entry.refs, "released external references");

            if entry.refs == 0 {
                let oid = entry.oid;
                exports.remove(&oid)
            } else {
                None
            }
        };

        // stubs and the object are dropped outside the apartment lock
        if let Some(entry) = removed {
            debug!(oxid = %self.oxid(), oid = %entry.oid, "destroyed exported object");
            drop(entry);
        }
        Ok(())
    }

    /// Forget one table-weak marshal of the object owning `ipid`. An entry
    /// left with no references of either kind is destroyed.
    pub(crate) fn release_table_weak(&self, ipid: Ipid) {
        let removed = {
            let mut tables = self.tables.lock();
            let exports = &mut tables.exports;
            match exports.owner_mut(&ipid) {
                Some(entry) => {
                    entry.weak_refs = entry.weak_refs.saturating_sub(1);
                    if entry.refs == 0 && entry.weak_refs == 0 {
                        let oid = entry.oid;
                        exports.remove(&oid)
                    } else {
                        None
                    }
                }
                None => {
                    trace!(%ipid, "table-weak release for object already gone");
                    None
                }
            }
        };
        if let Some(entry) = removed {
            debug!(oxid = %self.oxid(), oid = %entry.oid, "destroyed table-weak export");
        }
    }

    /// Drop an object's export entry regardless of its reference count.
    /// Later calls on it fail with `CO_E_OBJNOTCONNECTED`.
    pub fn disconnect_object(&self, object: &InterfacePtr) -> Result<()> {
        let removed = {
            let mut tables = self.tables.lock();
            let exports = &mut tables.exports;
            match exports.oid_of(object.identity()) {
                Some(oid) => exports.remove(&oid),
                None => None,
            }
        };
        if let Some(entry) = removed {
            debug!(oxid = %self.oxid(), oid = %entry.oid, refs = entry.refs, "disconnected object");
        }
        Ok(())
    }

    /// OID of an exported object
    pub fn exported_oid(&self, object: &InterfacePtr) -> Option<Oid> {
        self.tables.lock().exports.oid_of(object.identity())
    }

    /// Aggregate external reference count of an exported object
    pub fn object_refs(&self, oid: Oid) -> Option<u32> {
        let mut tables = self.tables.lock();
        tables.exports.prune();
        tables.exports.get(&oid).map(|e| e.refs)
    }

    pub fn table_weak_refs(&self, oid: Oid) -> Option<u32> {
        let mut tables = self.tables.lock();
        tables.exports.prune();
        tables.exports.get(&oid).map(|e| e.weak_refs)
    }

    /// External reference count of one exported interface
    pub fn interface_refs(&self, ipid: Ipid) -> Option<u32> {
        let tables = self.tables.lock();
        tables.exports.owner(&ipid)?.find_ipid(&ipid).map(|i| i.refs)
    }

    /// IPIDs handed out for an object, with their IIDs
    pub fn exported_interfaces(&self, oid: Oid) -> Vec<(Iid, Ipid)> {
        let tables = self.tables.lock();
        tables
            .exports
            .get(&oid)
            .map(|e| e.interfaces.iter().map(|i| (i.iid, i.ipid)).collect())
            .unwrap_or_default()
    }

    pub fn exported_objects(&self) -> usize {
        let mut tables = self.tables.lock();
        tables.exports.prune();
        tables.exports.len()
    }

    /// The object behind an exported interface
    pub(crate) fn exported_object(&self, ipid: &Ipid) -> Option<Arc<dyn ComObject>> {
        self.tables.lock().exports.owner(ipid).and_then(ExportedObject::object)
    }

    /// Stub for an inbound call on `ipid`, which must be an `iid` interface
    pub(crate) fn stub_for(&self, ipid: &Ipid, iid: &Iid) -> Result<Arc<dyn InterfaceStub>> {
        let tables = self.tables.lock();
        let interface = tables
            .exports
            .owner(ipid)
            .and_then(|e| e.find_ipid(ipid))
            .ok_or(ComError::ObjectNotConnected(*ipid))?;
        if interface.iid != *iid {
            return Err(ComError::NoInterface(*iid));
        }
        interface.stub.clone().ok_or(ComError::NoInterface(*iid))
    }
}

fn add_refs(exports: &mut ExportTable, ipid: &Ipid, n: u32) -> Result<()> {
    let entry = exports.owner_mut(ipid).ok_or(ComError::ObjectNotConnected(*ipid))?;
    if n > 0 {
        entry.take_hold().map_err(|_| ComError::ObjectNotConnected(*ipid))?;
    }
    let interface = entry
        .find_ipid_mut(ipid)
        .ok_or(ComError::ObjectNotConnected(*ipid))?;
    interface.refs += n;
    entry.refs += n;
    Ok(())
}
