//! Apartment type and its object tables

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::sta::Inbox;
use crate::exporter::ExportTable;
use crate::proxy::ProxyManager;
use crate::runtime::{ComConfig, Services};
use crate::types::{ComError, Oid, Oxid, Result};

/// Threading model of an apartment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApartmentKind {
    /// Single-threaded: inbound calls are queued and run by the task that
    /// pumps the apartment
    Sta,
    /// Multithreaded: inbound calls run concurrently on the worker pool
    Mta,
}

impl fmt::Display for ApartmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApartmentKind::Sta => f.write_str("STA"),
            ApartmentKind::Mta => f.write_str("MTA"),
        }
    }
}

/// Everything guarded by the apartment lock
#[derive(Default)]
pub(crate) struct Tables {
    pub exports: ExportTable,
    pub imports: HashMap<(Oxid, Oid), Arc<ProxyManager>>,
}

/// An apartment: an OXID plus the objects exported from and imported into it
pub struct Apartment {
    kind: ApartmentKind,
    oxid: Oxid,
    pub(crate) services: Arc<Services>,
    pub(crate) next_oid: AtomicU64,
    pub(crate) tables: Mutex<Tables>,
    pub(crate) inbox: Inbox,
    initialized: AtomicBool,
}

impl Apartment {
    pub(crate) fn new(kind: ApartmentKind, services: Arc<Services>) -> Arc<Self> {
        let apartment = Arc::new(Self {
            kind,
            oxid: Oxid::generate(),
            services,
            next_oid: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
            inbox: Inbox::new(),
            initialized: AtomicBool::new(true),
        });
        apartment.services.add_apartment(&apartment);
        info!(oxid = %apartment.oxid, kind = %kind, "apartment initialized");
        apartment
    }

    pub fn kind(&self) -> ApartmentKind {
        self.kind
    }

    pub fn oxid(&self) -> Oxid {
        self.oxid
    }

    pub fn is_sta(&self) -> bool {
        self.kind == ApartmentKind::Sta
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ComConfig {
        &self.services.config
    }

    pub(crate) fn check_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ComError::NotInitialized)
        }
    }

    /// Proxy manager for an imported object, if this apartment holds one
    pub fn imported(&self, oxid: Oxid, oid: Oid) -> Option<Arc<ProxyManager>> {
        self.tables.lock().imports.get(&(oxid, oid)).cloned()
    }

    pub fn imported_objects(&self) -> usize {
        self.tables.lock().imports.len()
    }

    /// Tear the apartment down: every imported object is released remotely
    /// and every exported object is disconnected. A running message loop
    /// is asked to quit.
    pub async fn uninitialize(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }

        let (exports, imports) = {
            let mut tables = self.tables.lock();
            let exports = tables.exports.drain();
            let imports: Vec<_> = tables.imports.drain().map(|(_, pm)| pm).collect();
            (exports, imports)
        };

        for pm in imports {
            if let Err(e) = pm.disconnect().await {
                warn!(oxid = %pm.oxid(), oid = %pm.oid(), error = %e, "remote release failed");
            }
        }
        debug!(oxid = %self.oxid, objects = exports.len(), "disconnected exported objects");
        drop(exports);

        self.services.remove_apartment(self.oxid);
        if self.is_sta() {
            self.post_quit();
        }
        info!(oxid = %self.oxid, "apartment uninitialized");
    }
}

impl Drop for Apartment {
    fn drop(&mut self) {
        self.services.remove_apartment(self.oxid);
    }
}

impl fmt::Debug for Apartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Apartment")
            .field("kind", &self.kind)
            .field("oxid", &self.oxid)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
