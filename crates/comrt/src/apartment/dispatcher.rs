//! Inbound call routing
//!
//! Each interface that has been exported at least once is registered with
//! the RPC server as a generic interface. The packet's object UUID is the
//! target IPID, which names the apartment (through its OXID bytes) and the
//! interface entry. MTA calls run on the server worker that received them;
//! STA calls are posted to the apartment's inbox.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::FutureExt;
use rpcrt::{CallContext, Interface, InterfaceBuilder, RpcError, SyntaxId};
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::{Apartment, ApartmentMessage};
use crate::runtime::Services;
use crate::types::{ComError, Iid, Ipid, Result};

/// RPC interface that routes calls on `iid` to exported objects
pub(crate) fn object_interface(services: Weak<Services>, iid: Iid) -> Interface {
    InterfaceBuilder::from_syntax(SyntaxId::new(iid, 0, 0))
        .generic(move |ctx: CallContext, args: Bytes| {
            let services = services.clone();
            async move {
                let ipid = Ipid::from(ctx.object());
                let method = u32::from(ctx.opnum);
                let outcome = match target_apartment(&services, ipid) {
                    Ok(apartment) => apartment.dispatch(ipid, ctx.interface.uuid, method, args).await,
                    Err(e) => Err(e),
                };
                outcome.map_err(|e| {
                    debug!(%ipid, method, error = %e, "call faulted");
                    e.into_fault()
                })
            }
        })
        .auto_listen()
        .build()
}

/// Apartment that issued `ipid`
pub(crate) fn target_apartment(services: &Weak<Services>, ipid: Ipid) -> Result<Arc<Apartment>> {
    let oxid = ipid.oxid();
    services
        .upgrade()
        .and_then(|services| services.apartment(oxid))
        .filter(|apartment| apartment.is_initialized())
        .ok_or(ComError::Disconnected(oxid))
}

impl Apartment {
    /// Run method `method` of the interface `ipid` names
    pub(crate) async fn dispatch(self: &Arc<Self>, ipid: Ipid, iid: Iid, method: u32, args: Bytes) -> Result<Bytes> {
        let stub = self.stub_for(&ipid, &iid)?;
        if !self.is_sta() {
            return stub.invoke(self, method, args).await;
        }

        let (tx, rx) = oneshot::channel();
        let apartment = Arc::downgrade(self);
        self.post(ApartmentMessage::Call(Box::pin(async move {
            let outcome = match apartment.upgrade() {
                Some(apartment) => AssertUnwindSafe(stub.invoke(&apartment, method, args))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(%ipid, method, "object panicked during call");
                        Err(ComError::Rpc(RpcError::CallFailed))
                    }),
                None => Err(ComError::Disconnected(ipid.oxid())),
            };
            let _ = tx.send(outcome);
        })))?;

        rx.await.map_err(|_| ComError::Rpc(RpcError::CallFailed))?
    }
}
