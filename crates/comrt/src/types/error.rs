//! Object runtime error types

use rpcrt::RpcError;
use thiserror::Error;

use super::identifiers::{Ipid, Oxid};
use rpcrt::Uuid;

/// Result type for object runtime operations
pub type Result<T> = std::result::Result<T, ComError>;

/// Object runtime errors
#[derive(Error, Debug)]
pub enum ComError {
    /// Transport or protocol failure in the RPC layer
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// The object does not implement the interface, or no proxy/stub
    /// factory is registered for it
    #[error("interface not supported: {0}")]
    NoInterface(Uuid),

    /// The exported object or interface is gone
    #[error("object not connected: IPID {0}")]
    ObjectNotConnected(Ipid),

    /// The exporting apartment is gone or cannot be reached
    #[error("apartment {0} disconnected")]
    Disconnected(Oxid),

    /// Malformed marshal record
    #[error("invalid object reference: {0}")]
    InvalidObjRef(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("method {0} out of range")]
    InvalidMethod(u32),

    /// Operation needs an apartment that has been uninitialized
    #[error("apartment not initialized")]
    NotInitialized,

    /// Failure code reported by the other side of a call
    #[error("call failed: HRESULT 0x{0:08x}")]
    Fault(u32),
}

/// HRESULT codes
pub mod hresult {
    pub const S_OK: u32 = 0x0000_0000;
    pub const S_FALSE: u32 = 0x0000_0001;
    pub const E_FAIL: u32 = 0x8000_4005;
    pub const E_NOINTERFACE: u32 = 0x8000_4002;
    pub const E_UNEXPECTED: u32 = 0x8000_FFFF;
    pub const E_INVALIDARG: u32 = 0x8007_0057;
    pub const CO_E_NOTINITIALIZED: u32 = 0x8004_01F0;
    pub const CO_E_OBJNOTCONNECTED: u32 = 0x8004_01FD;
    pub const RPC_E_DISCONNECTED: u32 = 0x8001_0108;
    pub const RPC_E_INVALID_OBJREF: u32 = 0x8001_011D;
    pub const RPC_E_INVALIDMETHOD: u32 = 0x8001_0104;

    /// Wrap a Win32 status code
    pub const fn from_win32(status: u32) -> u32 {
        if status == 0 || status & 0x8000_0000 != 0 {
            status
        } else {
            (status & 0xFFFF) | 0x8007_0000
        }
    }

    pub const fn succeeded(hr: u32) -> bool {
        hr & 0x8000_0000 == 0
    }
}

impl ComError {
    /// HRESULT carried in a fault for this error
    pub fn hresult(&self) -> u32 {
        use hresult::*;
        match self {
            ComError::Rpc(RpcError::Fault(code)) => *code,
            ComError::Rpc(e) => from_win32(e.status()),
            ComError::NoInterface(_) => E_NOINTERFACE,
            ComError::ObjectNotConnected(_) => CO_E_OBJNOTCONNECTED,
            ComError::Disconnected(_) => RPC_E_DISCONNECTED,
            ComError::InvalidObjRef(_) => RPC_E_INVALID_OBJREF,
            ComError::InvalidArgument(_) => E_INVALIDARG,
            ComError::InvalidMethod(_) => RPC_E_INVALIDMETHOD,
            ComError::NotInitialized => CO_E_NOTINITIALIZED,
            ComError::Fault(code) => *code,
        }
    }

    /// Rebuild an error from a fault code received off the wire
    pub fn from_fault(code: u32) -> Self {
        ComError::Fault(code)
    }

    /// Error to hand back to the RPC layer as a fault
    pub fn into_fault(self) -> RpcError {
        RpcError::Fault(self.hresult())
    }
}
