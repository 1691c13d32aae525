//! Client for a directory served over RPC

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::{
    epm_op, get_string, EndpointBinding, EndpointDirectory, RegistrationRequest, ResolveRequest,
    EPM_INTERFACE,
};
use crate::binding::Binding;
use crate::connection::Connector;
use crate::error::{status, Result, RpcError};
use crate::message::{send_and_receive, RpcMessage};
use crate::uuid::{SyntaxId, Uuid};

/// Talks to an [`EpmRegistry`](super::EpmRegistry) hosted by another runtime
pub struct EpmClient {
    connector: Arc<Connector>,
    binding: Binding,
}

impl EpmClient {
    pub fn new(connector: Arc<Connector>, protseq: &str, network_addr: &str, endpoint: &str) -> Self {
        Self {
            connector,
            binding: Binding::client(protseq, network_addr, endpoint),
        }
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    async fn call(&self, opnum: u16, encode: impl FnOnce(&mut bytes::BytesMut)) -> Result<Bytes> {
        let mut msg = RpcMessage::new(EPM_INTERFACE, opnum, 128);
        encode(&mut msg.buffer);
        send_and_receive(&self.connector, &self.binding, &mut msg)
            .await
            .map_err(|e| self.map_error(e))
    }

    fn map_error(&self, e: RpcError) -> RpcError {
        match e {
            RpcError::Fault(status::EPT_S_NOT_REGISTERED) => {
                RpcError::EptNotRegistered("no matching directory entry".into())
            }
            RpcError::Io(_)
            | RpcError::ConnectionClosed
            | RpcError::ServerUnavailable(_)
            | RpcError::ServerTooBusy => {
                let target = self.binding.to_string_binding();
                warn!(directory = %target, error = %e, "endpoint directory unreachable");
                RpcError::DirectoryUnavailable(target)
            }
            other => other,
        }
    }
}

#[async_trait]
impl EndpointDirectory for EpmClient {
    async fn register(
        &self,
        interface: SyntaxId,
        objects: &[Uuid],
        bindings: &[EndpointBinding],
        no_replace: bool,
    ) -> Result<()> {
        let request = RegistrationRequest {
            interface,
            objects: objects.to_vec(),
            bindings: bindings.to_vec(),
            no_replace,
        };
        self.call(epm_op::REGISTER, |buf| request.encode(buf)).await?;
        Ok(())
    }

    async fn unregister(
        &self,
        interface: SyntaxId,
        objects: &[Uuid],
        bindings: &[EndpointBinding],
    ) -> Result<()> {
        let request = RegistrationRequest {
            interface,
            objects: objects.to_vec(),
            bindings: bindings.to_vec(),
            no_replace: false,
        };
        self.call(epm_op::UNREGISTER, |buf| request.encode(buf)).await?;
        Ok(())
    }

    async fn resolve(&self, interface: SyntaxId, object: Uuid, protseq: &str) -> Result<String> {
        let request = ResolveRequest {
            interface,
            object,
            protseq: protseq.to_string(),
        };
        let mut reply = self.call(epm_op::RESOLVE, |buf| request.encode(buf)).await?;
        get_string(&mut reply)
    }
}
