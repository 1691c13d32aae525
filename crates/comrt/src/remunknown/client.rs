//! IRemUnknown client side

use std::sync::Arc;

use tracing::debug;

use super::protocol::{
    decode_hresults, decode_qi_results, encode_refs, opnum, RemInterfaceRef, RemQiRequest, RemQiResult,
};
use crate::channel::ClientChannel;
use crate::types::{iid, ComError, Iid, Ipid, Oxid, Result};

/// Talks to the IRemUnknown of one remote apartment
#[derive(Clone)]
pub struct RemUnknownClient {
    channel: Arc<ClientChannel>,
    ipid: Ipid,
}

impl RemUnknownClient {
    pub fn new(channel: Arc<ClientChannel>, oxid: Oxid) -> Self {
        Self {
            channel,
            ipid: Ipid::remunknown(oxid),
        }
    }

    pub fn ipid(&self) -> Ipid {
        self.ipid
    }

    /// Ask for more interfaces of the object owning `ipid`. One result per
    /// requested IID, in order.
    pub async fn rem_query_interface(&self, ipid: Ipid, public_refs: u32, iids: &[Iid]) -> Result<Vec<RemQiResult>> {
        let request = RemQiRequest {
            ipid,
            public_refs,
            iids: iids.to_vec(),
        };
        let mut reply = self
            .channel
            .call(self.ipid, iid::IREMUNKNOWN, opnum::REM_QUERY_INTERFACE.into(), request.encode())
            .await?;
        let results = decode_qi_results(&mut reply)?;
        if results.len() != iids.len() {
            return Err(ComError::InvalidArgument(format!(
                "asked for {} interfaces, got {} results",
                iids.len(),
                results.len()
            )));
        }
        Ok(results)
    }

    /// Add references; one HRESULT per entry
    pub async fn rem_add_ref(&self, refs: &[RemInterfaceRef]) -> Result<Vec<u32>> {
        let mut reply = self
            .channel
            .call(self.ipid, iid::IREMUNKNOWN, opnum::REM_ADD_REF.into(), encode_refs(refs))
            .await?;
        decode_hresults(&mut reply)
    }

    pub async fn rem_release(&self, refs: &[RemInterfaceRef]) -> Result<()> {
        debug!(oxid = %self.channel.oxid(), entries = refs.len(), "sending remote release");
        self.channel
            .call(self.ipid, iid::IREMUNKNOWN, opnum::REM_RELEASE.into(), encode_refs(refs))
            .await?;
        Ok(())
    }

    /// RemRelease from a task that does not own the calling apartment
    pub(crate) async fn rem_release_detached(&self, refs: &[RemInterfaceRef]) -> Result<()> {
        debug!(oxid = %self.channel.oxid(), entries = refs.len(), "sending detached remote release");
        self.channel
            .call_detached(self.ipid, iid::IREMUNKNOWN, opnum::REM_RELEASE.into(), encode_refs(refs))
            .await?;
        Ok(())
    }
}
