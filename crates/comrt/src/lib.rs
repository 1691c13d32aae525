//! Distributed object runtime
//!
//! Apartments, the standard marshaler and the stub/proxy machinery that let
//! an object living in one apartment be called from another, on top of the
//! `rpcrt` transport.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Object runtime (this crate)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Apartments          │  Stub manager     │  Marshaler       │
//! │  - MTA (concurrent)  │  - OID/IPID       │  - Normal        │
//! │  - STA (inbox pump)  │  - Ref counting   │  - Table weak    │
//! │  - Call dispatcher   │  Proxy manager    │  - Table strong  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  IRemUnknown         │  Client channel   │  Stubless plumbing│
//! ├─────────────────────────────────────────────────────────────┤
//! │                   RPC layer (rpcrt crate)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! - **OXID**: identifies an apartment
//! - **OID**: identifies one exported object within its apartment
//! - **IPID**: identifies one exported interface; the wire address of calls
//! - **Apartment**: an OXID plus its exported and imported object tables
//!
//! # Modules
//!
//! - [`types`]: identifiers, marshal records, errors
//! - [`object`]: the [`ComObject`] trait and interface pointers
//! - [`apartment`]: apartments, the STA inbox and inbound dispatch
//! - [`marshal`]: the standard marshaler
//! - [`remunknown`]: remote QueryInterface/AddRef/Release
//! - [`stubless`]: descriptor-driven proxies and stubs
//! - [`channel`]: outbound calls
//! - [`runtime`]: the process context

pub mod apartment;
pub mod channel;
pub mod marshal;
pub mod object;
pub mod remunknown;
pub mod runtime;
pub mod stubless;
pub mod types;

mod exporter;
mod proxy;

pub use apartment::{Apartment, ApartmentKind, ApartmentMessage};
pub use channel::{ChannelMode, ClientChannel};
pub use marshal::{marshal_interface, release_marshal_data, unmarshal_interface, MarshalMode};
pub use object::{ComObject, InterfacePtr, Value};
pub use proxy::ProxyManager;
pub use runtime::{ComConfig, ComRuntime};
pub use stubless::{ArgType, InterfaceDescriptor, MethodDescriptor, PsFactory};
pub use types::{
    hresult, iid, ComError, DualStringArray, Iid, Ipid, ObjRef, Oid, Oxid, Result, StdObjRef, StringBinding,
};
