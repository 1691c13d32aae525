//! Client call channel
//!
//! One channel per imported object. It turns a marshaled request into an
//! RPC round trip to the exporting apartment, addressed by IPID through the
//! binding's object UUID.
//!
//! Calls from an STA are apartment-threaded: the round trip runs on the
//! shared worker pool while the calling task keeps pumping its apartment, so
//! calls back into that apartment are served in the meantime. Calls from the
//! MTA do the round trip directly.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes};
use parking_lot::Mutex;
use rpcrt::{Binding, RpcError, RpcMessage, RpcRuntime, SyntaxId};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::apartment::Apartment;
use crate::types::{hresult, ComError, DualStringArray, Iid, Ipid, Oxid, Result};

/// How a channel waits for its replies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    /// Round trip on the worker pool while the caller pumps its apartment
    ApartmentThreaded,
    /// Round trip on the calling task
    FreeThreaded,
}

/// Connection to one exporting apartment
pub struct ClientChannel {
    rpc: Arc<RpcRuntime>,
    oxid: Oxid,
    protseq: &'static str,
    network_addr: String,
    endpoint: String,
    mode: ChannelMode,
    apartment: Weak<Apartment>,
    bindings: Mutex<HashMap<Ipid, Arc<Binding>>>,
}

impl ClientChannel {
    /// Channel from `apartment` to `oxid`, using the first string binding
    /// whose tower this runtime has a transport for
    pub(crate) fn new(apartment: &Arc<Apartment>, oxid: Oxid, bindings: &DualStringArray) -> Result<Arc<Self>> {
        let rpc = apartment.services.rpc.clone();
        let transports = rpc.connector().transports();
        let (transport, binding) = bindings
            .string_bindings
            .iter()
            .find_map(|b| transports.by_tower_id(b.tower_id).map(|t| (t, b)))
            .ok_or_else(|| {
                debug!(%oxid, "no usable string binding");
                ComError::Disconnected(oxid)
            })?;
        let (network_addr, endpoint) = binding.address();

        let mode = if apartment.is_sta() {
            ChannelMode::ApartmentThreaded
        } else {
            ChannelMode::FreeThreaded
        };
        trace!(%oxid, protseq = transport.protseq(), network_addr, endpoint, ?mode, "created channel");

        Ok(Arc::new(Self {
            protseq: transport.protseq(),
            network_addr: network_addr.to_string(),
            endpoint: endpoint.to_string(),
            rpc,
            oxid,
            mode,
            apartment: Arc::downgrade(apartment),
            bindings: Mutex::new(HashMap::new()),
        }))
    }

    pub fn oxid(&self) -> Oxid {
        self.oxid
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn protseq(&self) -> &str {
        self.protseq
    }

    pub fn network_addr(&self) -> &str {
        &self.network_addr
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn binding(&self, ipid: Ipid) -> Arc<Binding> {
        self.bindings
            .lock()
            .entry(ipid)
            .or_insert_with(|| {
                Arc::new(
                    Binding::client(self.protseq, &self.network_addr, &self.endpoint).with_object(ipid.uuid()),
                )
            })
            .clone()
    }

    fn map_error(&self, ipid: Ipid, e: RpcError) -> ComError {
        match e {
            RpcError::Fault(hresult::RPC_E_DISCONNECTED) => ComError::Disconnected(self.oxid),
            RpcError::Fault(hresult::CO_E_OBJNOTCONNECTED) => ComError::ObjectNotConnected(ipid),
            RpcError::Fault(code) => ComError::Fault(code),
            RpcError::ServerUnavailable(_)
            | RpcError::ConnectionClosed
            | RpcError::Io(_)
            | RpcError::DirectoryUnavailable(_)
            | RpcError::EptNotRegistered(_) => {
                debug!(oxid = %self.oxid, %ipid, error = %e, "exporter unreachable");
                ComError::Disconnected(self.oxid)
            }
            e => ComError::Rpc(e),
        }
    }

    /// Binding and request buffer for a call on `ipid`
    pub async fn get_buffer(
        &self,
        ipid: Ipid,
        iid: Iid,
        method: u32,
        size: usize,
    ) -> Result<(Arc<Binding>, RpcMessage)> {
        let opnum = u16::try_from(method).map_err(|_| ComError::InvalidMethod(method))?;
        let binding = self.binding(ipid);
        let msg = self
            .rpc
            .get_buffer(&binding, SyntaxId::new(iid, 0, 0), opnum, size)
            .await
            .map_err(|e| self.map_error(ipid, e))?;
        Ok((binding, msg))
    }

    /// Send the request in `msg` and wait for the reply
    pub async fn send_receive(&self, binding: &Arc<Binding>, msg: &mut RpcMessage) -> Result<Bytes> {
        self.round_trip(binding, msg, self.mode).await
    }

    async fn round_trip(&self, binding: &Arc<Binding>, msg: &mut RpcMessage, mode: ChannelMode) -> Result<Bytes> {
        let ipid = Ipid::from(binding.object());
        let apartment = match mode {
            ChannelMode::ApartmentThreaded => self.apartment.upgrade(),
            ChannelMode::FreeThreaded => None,
        };
        let result = match apartment {
            Some(apartment) => {
                let placeholder = RpcMessage::new(msg.interface, msg.opnum, 0);
                let owned = std::mem::replace(msg, placeholder);
                let (tx, rx) = oneshot::channel();
                let rpc = self.rpc.clone();
                let binding = binding.clone();
                self.rpc.pool().submit(async move {
                    let mut msg = owned;
                    let result = rpc.send_and_receive(&binding, &mut msg).await;
                    let _ = tx.send((msg, result));
                });
                let (returned, result) = apartment.pump_until(rx).await?;
                *msg = returned;
                result
            }
            None => self.rpc.send_and_receive(binding, msg).await,
        };
        result.map_err(|e| self.map_error(ipid, e))
    }

    pub fn free_buffer(&self, binding: &Arc<Binding>, msg: &mut RpcMessage) {
        self.rpc.free_buffer(binding, msg);
    }

    /// One call: buffer, round trip, cleanup
    pub async fn call(&self, ipid: Ipid, iid: Iid, method: u32, payload: Bytes) -> Result<Bytes> {
        self.call_in_mode(ipid, iid, method, payload, self.mode).await
    }

    /// A call made outside the apartment's own task, which must not pump it
    pub(crate) async fn call_detached(&self, ipid: Ipid, iid: Iid, method: u32, payload: Bytes) -> Result<Bytes> {
        self.call_in_mode(ipid, iid, method, payload, ChannelMode::FreeThreaded)
            .await
    }

    async fn call_in_mode(&self, ipid: Ipid, iid: Iid, method: u32, payload: Bytes, mode: ChannelMode) -> Result<Bytes> {
        let (binding, mut msg) = self.get_buffer(ipid, iid, method, payload.len()).await?;
        msg.buffer.put_slice(&payload);
        let result = self.round_trip(&binding, &mut msg, mode).await;
        self.free_buffer(&binding, &mut msg);
        result
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("oxid", &self.oxid)
            .field("protseq", &self.protseq)
            .field("endpoint", &self.endpoint)
            .field("mode", &self.mode)
            .finish()
    }
}
