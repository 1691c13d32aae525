//! Table-driven proxies and stubs
//!
//! An interface is described once by an [`InterfaceDescriptor`]: its IID and,
//! per method, the types of the `[in]` and `[out]` arguments. A single
//! generic proxy and a single generic stub drive every call from that table,
//! so no per-method code is generated.
//!
//! ```
//! use comrt::stubless::{ArgType, InterfaceDescriptor, MethodDescriptor};
//! use comrt::Iid;
//!
//! static ADDER: InterfaceDescriptor = InterfaceDescriptor {
//!     iid: Iid::from_u128(0x6d1ba6b4_0c4e_4cde_9d1e_1a2b3c4d5e6f),
//!     name: "IAdder",
//!     methods: &[MethodDescriptor {
//!         name: "Add",
//!         ins: &[ArgType::I32, ArgType::I32],
//!         outs: &[ArgType::I32],
//!     }],
//! };
//!
//! assert_eq!(ADDER.method(3).unwrap().name, "Add");
//! assert!(ADDER.method(2).is_err());
//! ```

pub mod codec;
mod proxy;
mod registry;
mod stub;

pub use proxy::{InterfaceProxy, StublessProxy};
pub use registry::{PsFactory, PsRegistry, StublessFactory};
pub use stub::{InterfaceStub, StublessStub};

use crate::types::{ComError, Iid, Result};

/// Method number of the first method after QueryInterface, AddRef and Release
pub const FIRST_METHOD: u32 = 3;

/// Wire type of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    U32,
    I32,
    U64,
    /// Length-prefixed byte blob
    Bytes,
    /// Length-prefixed UTF-8
    Str,
    /// Interface pointer of the given IID, marshaled by value
    Interface(Iid),
}

#[derive(Debug)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub ins: &'static [ArgType],
    pub outs: &'static [ArgType],
}

/// Interface description shared by its proxy and stub
#[derive(Debug)]
pub struct InterfaceDescriptor {
    pub iid: Iid,
    pub name: &'static str,
    /// Methods in vtable order, starting at [`FIRST_METHOD`]
    pub methods: &'static [MethodDescriptor],
}

impl InterfaceDescriptor {
    pub fn method(&self, method: u32) -> Result<&MethodDescriptor> {
        method
            .checked_sub(FIRST_METHOD)
            .and_then(|index| self.methods.get(index as usize))
            .ok_or(ComError::InvalidMethod(method))
    }

    /// Number of vtable slots including the three identity methods
    pub fn method_count(&self) -> u32 {
        FIRST_METHOD + self.methods.len() as u32
    }
}
