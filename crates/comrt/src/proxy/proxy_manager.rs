//! Proxy manager: the import side of an apartment
//!
//! One proxy manager stands for one remote object `(OXID, OID)` within an
//! apartment. It keeps the interfaces imported so far with the public
//! references held on each, and a local count of live [`InterfacePtr`]s.
//! When the local count drops to zero the manager leaves the apartment's
//! import table and sends a single RemRelease for every reference it holds.
//!
//! [`InterfacePtr`]: crate::object::InterfacePtr

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::apartment::Apartment;
use crate::channel::ClientChannel;
use crate::object::{ComObject, Value};
use crate::remunknown::{RemInterfaceRef, RemUnknownClient};
use crate::runtime::Services;
use crate::stubless::InterfaceProxy;
use crate::types::{hresult, iid, ComError, DualStringArray, Iid, Ipid, ObjRef, Oid, Oxid, Result, StdObjRef};

/// One interface imported on a remote object
struct ImportedInterface {
    iid: Iid,
    ipid: Ipid,
    public_refs: u32,
    proxy: Option<Arc<dyn InterfaceProxy>>,
}

/// Local stand-in for a remote object
pub struct ProxyManager {
    oxid: Oxid,
    oid: Oid,
    /// IPID the object was first imported through; target of remote QI
    ipid: Ipid,
    bindings: DualStringArray,
    channel: Arc<ClientChannel>,
    remunknown: RemUnknownClient,
    services: Arc<Services>,
    apartment: Weak<Apartment>,
    interfaces: Mutex<Vec<ImportedInterface>>,
    refs: AtomicU32,
    disconnected: AtomicBool,
}

fn hresult_error(hr: u32, iid: Iid, ipid: Ipid) -> ComError {
    match hr {
        hresult::E_NOINTERFACE => ComError::NoInterface(iid),
        hresult::CO_E_OBJNOTCONNECTED => ComError::ObjectNotConnected(ipid),
        hr => ComError::Fault(hr),
    }
}

impl ProxyManager {
    /// Manager for the object a marshal record names, with no references
    pub(crate) fn new(apartment: &Arc<Apartment>, objref: &ObjRef) -> Result<Arc<Self>> {
        let oxid = objref.std.oxid;
        let channel = ClientChannel::new(apartment, oxid, &objref.bindings)?;
        Ok(Arc::new(Self {
            oxid,
            oid: objref.std.oid,
            ipid: objref.std.ipid,
            bindings: objref.bindings.clone(),
            remunknown: RemUnknownClient::new(channel.clone(), oxid),
            channel,
            services: apartment.services.clone(),
            apartment: Arc::downgrade(apartment),
            interfaces: Mutex::new(Vec::new()),
            refs: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
        }))
    }

    pub fn oxid(&self) -> Oxid {
        self.oxid
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn channel(&self) -> &Arc<ClientChannel> {
        &self.channel
    }

    /// Live local references
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Public references held on the remote interface `iid`
    pub fn interface_refs(&self, iid: &Iid) -> Option<u32> {
        self.interfaces
            .lock()
            .iter()
            .find(|i| i.iid == *iid)
            .map(|i| i.public_refs)
    }

    pub fn ipid_of(&self, iid: &Iid) -> Option<Ipid> {
        self.interfaces.lock().iter().find(|i| i.iid == *iid).map(|i| i.ipid)
    }

    /// Imported interfaces with the public references held on each
    pub fn interfaces(&self) -> Vec<(Iid, Ipid, u32)> {
        self.interfaces
            .lock()
            .iter()
            .map(|i| (i.iid, i.ipid, i.public_refs))
            .collect()
    }

    pub(crate) fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one local reference. Reaching zero unlinks the manager from its
    /// apartment in the same critical section, so a concurrent unmarshal
    /// either finds it still referenced or creates a fresh one.
    fn decrement(&self) -> Option<u32> {
        let dec = || {
            self.refs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
                .ok()
                .map(|prev| prev - 1)
        };
        let Some(apartment) = self.apartment.upgrade() else {
            return dec();
        };
        let mut tables = apartment.tables.lock();
        let remaining = dec();
        if remaining == Some(0) {
            let key = (self.oxid, self.oid);
            let is_self = tables
                .imports
                .get(&key)
                .is_some_and(|pm| std::ptr::eq(Arc::as_ptr(pm), self));
            if is_self {
                tables.imports.remove(&key);
            }
        }
        remaining
    }

    /// Release one local reference; the last one releases the remote object
    pub async fn release(&self) -> Result<u32> {
        match self.decrement() {
            Some(0) => {
                self.release_remote().await?;
                Ok(0)
            }
            Some(n) => Ok(n),
            None => {
                trace!(oxid = %self.oxid, oid = %self.oid, "release on a proxy with no references");
                Ok(0)
            }
        }
    }

    /// Release from a destructor. The remote release, if any, runs on a
    /// spawned task without pumping the owning apartment.
    pub(crate) fn release_detached(&self) {
        if self.decrement() != Some(0) {
            return;
        }
        let refs = self.take_remote_refs();
        if refs.is_empty() {
            return;
        }
        let client = self.remunknown.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.rem_release_detached(&refs).await {
                        warn!(error = %e, "remote release failed");
                    }
                });
            }
            Err(_) => warn!(oxid = %self.oxid, oid = %self.oid, "no runtime to send remote release on"),
        }
    }

    /// Empty the interface list and return the references to give back
    fn take_remote_refs(&self) -> Vec<RemInterfaceRef> {
        let interfaces = std::mem::take(&mut *self.interfaces.lock());
        interfaces
            .iter()
            .filter(|i| i.public_refs > 0)
            .map(|i| RemInterfaceRef::new(i.ipid, i.public_refs))
            .collect()
    }

    async fn release_remote(&self) -> Result<()> {
        let refs = self.take_remote_refs();
        debug!(
            oxid = %self.oxid,
            oid = %self.oid,
            interfaces = refs.len(),
            total = refs.iter().map(RemInterfaceRef::total).sum::<u32>(),
            "releasing imported object"
        );
        if refs.is_empty() {
            return Ok(());
        }
        self.remunknown.rem_release(&refs).await
    }

    /// Give back every remote reference whatever the local count
    pub(crate) async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::Release);
        self.refs.store(0, Ordering::Release);
        self.release_remote().await
    }

    /// Record `public_refs` references on `ipid`. An interface left with no
    /// references is topped up with a RemAddRef before anyone can use it.
    pub(crate) async fn import_interface(&self, iid: Iid, ipid: Ipid, public_refs: u32) -> Result<()> {
        let held = {
            let mut interfaces = self.interfaces.lock();
            match interfaces.iter_mut().find(|i| i.ipid == ipid) {
                Some(entry) => {
                    entry.public_refs += public_refs;
                    entry.public_refs
                }
                None => {
                    let proxy = match iid {
                        iid::IUNKNOWN => None,
                        iid => self
                            .services
                            .ps
                            .get(&iid)
                            .map(|factory| factory.create_proxy(ipid, self.channel.clone())),
                    };
                    interfaces.push(ImportedInterface {
                        iid,
                        ipid,
                        public_refs,
                        proxy,
                    });
                    trace!(oxid = %self.oxid, oid = %self.oid, %iid, %ipid, public_refs, "imported interface");
                    public_refs
                }
            }
        };
        if held > 0 {
            return Ok(());
        }

        let batch = self.services.config.remote_addref_batch;
        let results = self.remunknown.rem_add_ref(&[RemInterfaceRef::new(ipid, batch)]).await?;
        match results.first() {
            Some(&hresult::S_OK) => {
                if let Some(entry) = self.interfaces.lock().iter_mut().find(|i| i.ipid == ipid) {
                    entry.public_refs += batch;
                }
                Ok(())
            }
            Some(&hr) => Err(hresult_error(hr, iid, ipid)),
            None => Err(ComError::InvalidArgument("empty RemAddRef reply".into())),
        }
    }

    /// Import `iid` from the remote object unless it is already here
    async fn fetch_interface(&self, iid: Iid) -> Result<()> {
        if self.is_disconnected() {
            return Err(ComError::Disconnected(self.oxid));
        }
        if self.ipid_of(&iid).is_some() {
            return Ok(());
        }
        let refs = self.services.config.qi_public_refs;
        let result = self
            .remunknown
            .rem_query_interface(self.ipid, refs, &[iid])
            .await?
            .into_iter()
            .next()
            .ok_or(ComError::NoInterface(iid))?;
        match result.std {
            Some(std) if result.hresult == hresult::S_OK => {
                self.import_interface(iid, std.ipid, std.public_refs).await
            }
            _ => Err(hresult_error(result.hresult, iid, self.ipid)),
        }
    }

    /// Make `iid` callable on this object, asking the exporter if needed
    pub async fn query_interface(&self, iid: Iid) -> Result<()> {
        if self.is_disconnected() {
            return Err(ComError::Disconnected(self.oxid));
        }
        if iid == iid::IUNKNOWN {
            return Ok(());
        }
        if !self.services.ps.contains(&iid) {
            return Err(ComError::NoInterface(iid));
        }
        self.fetch_interface(iid).await
    }

    /// Marshal record for the remote object itself, carrying `refs` fresh
    /// references taken from the exporter
    pub(crate) async fn marshal_out(&self, iid: Iid, refs: u32) -> Result<ObjRef> {
        self.fetch_interface(iid).await?;
        let ipid = self.ipid_of(&iid).ok_or(ComError::NoInterface(iid))?;
        if refs > 0 {
            let results = self.remunknown.rem_add_ref(&[RemInterfaceRef::new(ipid, refs)]).await?;
            match results.first() {
                Some(&hresult::S_OK) => {}
                Some(&hr) => return Err(hresult_error(hr, iid, ipid)),
                None => return Err(ComError::InvalidArgument("empty RemAddRef reply".into())),
            }
        }
        Ok(ObjRef {
            std: StdObjRef::new(self.oxid, self.oid, ipid, refs),
            iid,
            bindings: self.bindings.clone(),
        })
    }
}

#[async_trait]
impl ComObject for ProxyManager {
    fn implements(&self, iid: &Iid) -> bool {
        *iid == iid::IUNKNOWN || self.ipid_of(iid).is_some()
    }

    async fn invoke(&self, iid: &Iid, method: u32, args: Vec<Value>) -> Result<Vec<Value>> {
        if self.is_disconnected() {
            return Err(ComError::Disconnected(self.oxid));
        }
        let proxy = self
            .interfaces
            .lock()
            .iter()
            .find(|i| i.iid == *iid)
            .and_then(|i| i.proxy.clone())
            .ok_or(ComError::NoInterface(*iid))?;
        let apartment = self.apartment.upgrade().ok_or(ComError::NotInitialized)?;
        proxy.invoke(&apartment, method, args).await
    }

    fn as_proxy(&self) -> Option<&ProxyManager> {
        Some(self)
    }
}

impl std::fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyManager")
            .field("oxid", &self.oxid)
            .field("oid", &self.oid)
            .field("refs", &self.refs())
            .field("interfaces", &self.interfaces.lock().len())
            .finish()
    }
}
