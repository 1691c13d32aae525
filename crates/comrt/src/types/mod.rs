//! Core object runtime types
//!
//! - Identifiers: OXID, OID, IPID
//! - Marshal records and the binding strings they carry
//! - Errors and HRESULT codes

mod error;
mod identifiers;
mod objref;
mod stringbinding;

pub use error::*;
pub use identifiers::{Ipid, Oid, Oxid};
pub use objref::{flags, ObjRef, StdObjRef};
pub use stringbinding::{DualStringArray, StringBinding};

/// Interface identifier
pub type Iid = rpcrt::Uuid;

/// Well-known interface identifiers
pub mod iid {
    use super::Iid;

    pub const IUNKNOWN: Iid = Iid::from_u128(0x00000000_0000_0000_c000_000000000046);
    pub const IREMUNKNOWN: Iid = Iid::from_u128(0x00000131_0000_0000_c000_000000000046);
}
