//! IRemUnknown server side
//!
//! Reference counting and QueryInterface calls are answered straight from the
//! target apartment's export table on the receiving worker; they never wait
//! for an STA to pump.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use rpcrt::{CallContext, Interface, InterfaceBuilder};
use tracing::{debug, warn};

use super::protocol::{
    decode_refs, encode_hresults, encode_qi_results, opnum, RemQiRequest, RemQiResult, REMUNKNOWN_SYNTAX,
};
use crate::apartment::{target_apartment, Apartment};
use crate::runtime::Services;
use crate::types::{hresult, ComError, Ipid, Result};

/// The IRemUnknown interface for every apartment of a runtime
pub(crate) fn remunknown_interface(services: Weak<Services>) -> Interface {
    let qi = services.clone();
    let add_ref = services.clone();
    let release = services;
    InterfaceBuilder::from_syntax(REMUNKNOWN_SYNTAX)
        .operation_with_context(opnum::REM_QUERY_INTERFACE, move |ctx, args| {
            let services = qi.clone();
            async move { serve(&services, &ctx, rem_query_interface, args).await }
        })
        .operation_with_context(opnum::REM_ADD_REF, move |ctx, args| {
            let services = add_ref.clone();
            async move { serve(&services, &ctx, rem_add_ref, args).await }
        })
        .operation_with_context(opnum::REM_RELEASE, move |ctx, args| {
            let services = release.clone();
            async move { serve(&services, &ctx, rem_release, args).await }
        })
        .auto_listen()
        .build()
}

async fn serve<F, Fut>(services: &Weak<Services>, ctx: &CallContext, op: F, args: Bytes) -> rpcrt::Result<Bytes>
where
    F: FnOnce(Arc<Apartment>, Bytes) -> Fut,
    Fut: std::future::Future<Output = Result<Bytes>>,
{
    let ipid = Ipid::from(ctx.object());
    let outcome = match target_apartment(services, ipid) {
        Ok(apartment) if ipid == Ipid::remunknown(apartment.oxid()) => op(apartment, args).await,
        Ok(_) => Err(ComError::ObjectNotConnected(ipid)),
        Err(e) => Err(e),
    };
    outcome.map_err(|e| {
        debug!(%ipid, opnum = ctx.opnum, error = %e, "IRemUnknown call faulted");
        e.into_fault()
    })
}

async fn rem_query_interface(apartment: Arc<Apartment>, mut args: Bytes) -> Result<Bytes> {
    let request = RemQiRequest::decode(&mut args)?;
    if apartment.exported_object(&request.ipid).is_none() {
        return Err(ComError::ObjectNotConnected(request.ipid));
    }

    let mut results = Vec::with_capacity(request.iids.len());
    for iid in request.iids {
        let result = match apartment.export_sibling(request.ipid, iid, request.public_refs).await {
            Ok(std) => RemQiResult::success(std),
            Err(e) => {
                debug!(ipid = %request.ipid, %iid, error = %e, "remote QueryInterface failed");
                RemQiResult::failure(e.hresult())
            }
        };
        results.push(result);
    }
    Ok(encode_qi_results(&results))
}

async fn rem_add_ref(apartment: Arc<Apartment>, mut args: Bytes) -> Result<Bytes> {
    let refs = decode_refs(&mut args)?;
    let results: Vec<u32> = refs
        .iter()
        .map(|r| match apartment.add_external_refs(r.ipid, r.total()) {
            Ok(()) => hresult::S_OK,
            Err(e) => e.hresult(),
        })
        .collect();
    Ok(encode_hresults(&results))
}

async fn rem_release(apartment: Arc<Apartment>, mut args: Bytes) -> Result<Bytes> {
    let refs = decode_refs(&mut args)?;
    debug!(oxid = %apartment.oxid(), entries = refs.len(), "remote release");
    for r in refs {
        if let Err(e) = apartment.release_external_refs(r.ipid, r.total()) {
            warn!(ipid = %r.ipid, error = %e, "remote release of unknown interface");
        }
    }
    Ok(Bytes::new())
}
