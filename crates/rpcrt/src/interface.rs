//! Server-side interface definitions
//!
//! An interface is either a table of per-opnum handlers or a single generic
//! entry point that receives every opnum (used by object runtimes that route
//! calls by object UUID themselves).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::binding::Binding;
use crate::error::{Result, RpcError};
use crate::packet::PacketHeader;
use crate::uuid::{SyntaxId, Uuid};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>;

/// Operation handler: call context plus request payload in, reply payload out
pub type OperationHandler = Arc<dyn Fn(CallContext, Bytes) -> HandlerFuture + Send + Sync>;

/// What a handler knows about the call it is serving
#[derive(Clone)]
pub struct CallContext {
    /// Transient server binding carrying the packet's object UUID
    pub binding: Arc<Binding>,
    pub interface: SyntaxId,
    pub opnum: u16,
    pub header: PacketHeader,
}

impl CallContext {
    pub fn object(&self) -> Uuid {
        self.binding.object()
    }
}

#[derive(Clone)]
pub(crate) enum Dispatch {
    Table(HashMap<u16, OperationHandler>),
    Generic(OperationHandler),
}

/// A registered interface
#[derive(Clone)]
pub struct Interface {
    pub(crate) syntax: SyntaxId,
    pub(crate) manager_type: Uuid,
    pub(crate) auto_listen: bool,
    pub(crate) dispatch: Dispatch,
}

impl Interface {
    pub fn syntax(&self) -> SyntaxId {
        self.syntax
    }

    pub fn uuid(&self) -> Uuid {
        self.syntax.uuid
    }

    pub fn manager_type(&self) -> Uuid {
        self.manager_type
    }

    pub fn auto_listen(&self) -> bool {
        self.auto_listen
    }

    /// Handler for `opnum`
    pub fn handler(&self, opnum: u16) -> Result<OperationHandler> {
        match &self.dispatch {
            Dispatch::Generic(handler) => Ok(handler.clone()),
            Dispatch::Table(ops) => ops
                .get(&opnum)
                .cloned()
                .ok_or(RpcError::OperationUnavailable(opnum)),
        }
    }
}

pub struct InterfaceBuilder {
    interface: Interface,
}

impl InterfaceBuilder {
    pub fn new(uuid: &str, major_version: u16, minor_version: u16) -> Option<Self> {
        let uuid = Uuid::parse(uuid)?;
        Some(Self::from_syntax(SyntaxId::new(uuid, major_version, minor_version)))
    }

    pub fn from_syntax(syntax: SyntaxId) -> Self {
        Self {
            interface: Interface {
                syntax,
                manager_type: Uuid::NIL,
                auto_listen: false,
                dispatch: Dispatch::Table(HashMap::new()),
            },
        }
    }

    /// Handler that only needs the payload
    pub fn operation<F, Fut>(self, opnum: u16, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.operation_with_context(opnum, move |_ctx, args| handler(args))
    }

    pub fn operation_with_context<F, Fut>(mut self, opnum: u16, handler: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let handler: OperationHandler =
            Arc::new(move |ctx: CallContext, args: Bytes| -> HandlerFuture { Box::pin(handler(ctx, args)) });
        match &mut self.interface.dispatch {
            Dispatch::Table(ops) => {
                ops.insert(opnum, handler);
            }
            Dispatch::Generic(_) => {
                let mut ops = HashMap::new();
                ops.insert(opnum, handler);
                self.interface.dispatch = Dispatch::Table(ops);
            }
        }
        self
    }

    /// Route every opnum to one entry point
    pub fn generic<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.interface.dispatch = Dispatch::Generic(Arc::new(
            move |ctx: CallContext, args: Bytes| -> HandlerFuture { Box::pin(handler(ctx, args)) },
        ));
        self
    }

    /// Only accept calls on objects whose type is `manager_type`
    pub fn manager_type(mut self, manager_type: Uuid) -> Self {
        self.interface.manager_type = manager_type;
        self
    }

    /// Keep the server listening for as long as this interface is registered
    pub fn auto_listen(mut self) -> Self {
        self.interface.auto_listen = true;
        self
    }

    pub fn build(self) -> Interface {
        self.interface
    }
}
