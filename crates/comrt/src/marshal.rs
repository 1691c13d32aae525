//! Standard marshaler
//!
//! Turns an interface pointer into a marshal record another apartment can
//! unmarshal, and back.
//!
//! - Normal: the record carries `normal_refs` references for the receiver
//! - TableStrong: no references in the record, but the exporter holds one
//!   until [`release_marshal_data`] is called; may be unmarshaled many times
//! - TableWeak: no references at all; the record does not keep the object
//!   alive
//!
//! Unmarshaling in the exporting apartment itself returns the object
//! directly and gives the carried references back.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::apartment::Apartment;
use crate::channel::ClientChannel;
use crate::object::InterfacePtr;
use crate::proxy::ProxyManager;
use crate::remunknown::{RemInterfaceRef, RemUnknownClient};
use crate::types::{flags, ComError, Iid, ObjRef, Result, StdObjRef};

/// How long a marshal record keeps its object alive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarshalMode {
    /// Unmarshaled once; transfers references to the receiver
    Normal,
    /// Table marshal without a reference
    TableWeak,
    /// Table marshal holding one reference until released
    TableStrong,
}

/// Marshal `ptr` for `iid`
pub async fn marshal_interface(
    apartment: &Arc<Apartment>,
    ptr: &InterfacePtr,
    iid: Iid,
    mode: MarshalMode,
) -> Result<Bytes> {
    apartment.check_initialized()?;

    if let Some(proxy) = ptr.proxy() {
        if mode != MarshalMode::Normal {
            return Err(ComError::InvalidArgument(format!(
                "{:?} marshal of an imported object",
                mode
            )));
        }
        let objref = proxy.marshal_out(iid, apartment.config().normal_refs).await?;
        trace!(oxid = %objref.std.oxid, oid = %objref.std.oid, %iid, "marshaled proxy");
        return Ok(objref.to_bytes());
    }

    let normal_refs = apartment.config().normal_refs;
    // (encoded, held by the exporter, table-weak)
    let (encoded, held, weak) = match mode {
        MarshalMode::Normal => (normal_refs, normal_refs, 0),
        MarshalMode::TableStrong => (0, 1, 0),
        MarshalMode::TableWeak => (0, 0, 1),
    };
    let (oid, ipid) = apartment.export_with_refs(ptr.object(), iid, held, weak).await?;

    let mut std = StdObjRef::new(apartment.oxid(), oid, ipid, encoded);
    if mode == MarshalMode::TableStrong {
        std.flags |= flags::TABLE_STRONG;
    }
    if !apartment.config().ping_free {
        std.flags &= !flags::NO_PING;
    }
    let objref = ObjRef {
        std,
        iid,
        bindings: apartment.services.bindings.clone(),
    };
    debug!(oxid = %apartment.oxid(), %oid, %ipid, ?mode, refs = encoded, "marshaled interface");
    Ok(objref.to_bytes())
}

/// Unmarshal a record into `apartment` and return a pointer for `iid`
pub async fn unmarshal_interface(apartment: &Arc<Apartment>, data: &[u8], iid: Iid) -> Result<InterfacePtr> {
    apartment.check_initialized()?;
    let objref = ObjRef::decode(&mut &data[..])?;
    let std = objref.std;

    if std.oxid == apartment.oxid() {
        let object = apartment
            .exported_object(&std.ipid)
            .ok_or(ComError::ObjectNotConnected(std.ipid))?;
        apartment.release_external_refs(std.ipid, std.public_refs)?;
        trace!(oxid = %std.oxid, oid = %std.oid, "unmarshaled in exporting apartment");
        return InterfacePtr::new(objref.iid, object).query_interface(iid).await;
    }

    let proxy = {
        let mut tables = apartment.tables.lock();
        let key = (std.oxid, std.oid);
        let proxy = match tables.imports.get(&key) {
            Some(proxy) => proxy.clone(),
            None => {
                let proxy = ProxyManager::new(apartment, &objref)?;
                tables.imports.insert(key, proxy.clone());
                debug!(oxid = %std.oxid, oid = %std.oid, importer = %apartment.oxid(), "created proxy manager");
                proxy
            }
        };
        // taken under the lock so a concurrent last release cannot unlink it
        proxy.add_ref();
        proxy
    };

    let imported = async {
        proxy.import_interface(objref.iid, std.ipid, std.public_refs).await?;
        proxy.query_interface(iid).await
    };
    if let Err(e) = imported.await {
        if let Err(release) = proxy.release().await {
            debug!(error = %release, "release after failed unmarshal");
        }
        return Err(e);
    }
    Ok(InterfacePtr::from_proxy(iid, proxy))
}

/// Give back the references a record holds without unmarshaling it
pub async fn release_marshal_data(apartment: &Arc<Apartment>, data: &[u8]) -> Result<()> {
    let objref = ObjRef::decode(&mut &data[..])?;
    let std = objref.std;
    let refs = if std.is_table_strong() { 1 } else { std.public_refs };

    if let Some(exporter) = apartment.services.apartment(std.oxid) {
        trace!(oxid = %std.oxid, ipid = %std.ipid, refs, "releasing marshal data");
        if refs > 0 {
            exporter.release_external_refs(std.ipid, refs)
        } else {
            exporter.release_table_weak(std.ipid);
            Ok(())
        }
    } else if refs > 0 {
        let channel = ClientChannel::new(apartment, std.oxid, &objref.bindings)?;
        RemUnknownClient::new(channel, std.oxid)
            .rem_release(&[RemInterfaceRef::new(std.ipid, refs)])
            .await
    } else {
        Ok(())
    }
}
