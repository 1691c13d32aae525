//! Error types for the RPC runtime

use thiserror::Error;

/// Win32 RPC status codes carried in fault packets and returned by
/// [`RpcError::status`].
pub mod status {
    pub const RPC_S_OK: u32 = 0;
    pub const RPC_S_OUT_OF_MEMORY: u32 = 14;
    pub const RPC_S_INVALID_STRING_BINDING: u32 = 1700;
    pub const RPC_S_WRONG_KIND_OF_BINDING: u32 = 1701;
    pub const RPC_S_INVALID_BINDING: u32 = 1702;
    pub const RPC_S_PROTSEQ_NOT_SUPPORTED: u32 = 1703;
    pub const RPC_S_INVALID_ENDPOINT_FORMAT: u32 = 1706;
    pub const RPC_S_NO_ENDPOINT_FOUND: u32 = 1708;
    pub const RPC_S_ALREADY_REGISTERED: u32 = 1711;
    pub const RPC_S_ALREADY_LISTENING: u32 = 1713;
    pub const RPC_S_NOT_LISTENING: u32 = 1715;
    pub const RPC_S_UNKNOWN_MGR_TYPE: u32 = 1716;
    pub const RPC_S_UNKNOWN_IF: u32 = 1717;
    pub const RPC_S_CANT_CREATE_ENDPOINT: u32 = 1720;
    pub const RPC_S_SERVER_UNAVAILABLE: u32 = 1722;
    pub const RPC_S_SERVER_TOO_BUSY: u32 = 1723;
    pub const RPC_S_CALL_FAILED: u32 = 1726;
    pub const RPC_S_PROTOCOL_ERROR: u32 = 1728;
    pub const RPC_S_PROCNUM_OUT_OF_RANGE: u32 = 1745;
    pub const EPT_S_NOT_REGISTERED: u32 = 1753;
}

/// RPC runtime errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("short read: needed {needed} bytes, have {have}")]
    ShortRead { needed: usize, have: usize },

    #[error("unexpected packet type {got} (expected {expected})")]
    UnexpectedPacketType { expected: &'static str, got: u8 },

    #[error("packet version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("server too busy")]
    ServerTooBusy,

    #[error("protocol sequence not supported: {0}")]
    ProtseqNotSupported(String),

    #[error("invalid string binding: {0}")]
    InvalidStringBinding(String),

    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    #[error("wrong kind of binding")]
    WrongKindOfBinding,

    #[error("endpoint already in use: {0}")]
    EndpointInUse(String),

    #[error("interface not registered: {0}")]
    UnknownInterface(String),

    #[error("interface already registered: {0}")]
    AlreadyRegistered(String),

    #[error("object type not accepted by interface: {0}")]
    UnknownManagerType(String),

    #[error("operation {0} out of range")]
    OperationUnavailable(u16),

    #[error("server is not listening")]
    NotListening,

    #[error("server is already listening")]
    AlreadyListening,

    #[error("endpoint directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("endpoint not registered for interface {0}")]
    EptNotRegistered(String),

    #[error("remote call failed")]
    CallFailed,

    #[error("fault: status 0x{0:08x}")]
    Fault(u32),
}

impl RpcError {
    /// Status code sent in a fault packet for this error
    pub fn status(&self) -> u32 {
        use status::*;
        match self {
            RpcError::Io(_) | RpcError::ConnectionClosed => RPC_S_CALL_FAILED,
            RpcError::Protocol(_)
            | RpcError::ShortRead { .. }
            | RpcError::UnexpectedPacketType { .. }
            | RpcError::VersionMismatch { .. } => RPC_S_PROTOCOL_ERROR,
            RpcError::PayloadTooLarge { .. } => RPC_S_OUT_OF_MEMORY,
            RpcError::ServerUnavailable(_) => RPC_S_SERVER_UNAVAILABLE,
            RpcError::ServerTooBusy => RPC_S_SERVER_TOO_BUSY,
            RpcError::ProtseqNotSupported(_) => RPC_S_PROTSEQ_NOT_SUPPORTED,
            RpcError::InvalidStringBinding(_) => RPC_S_INVALID_STRING_BINDING,
            RpcError::InvalidBinding(_) => RPC_S_INVALID_BINDING,
            RpcError::WrongKindOfBinding => RPC_S_WRONG_KIND_OF_BINDING,
            RpcError::EndpointInUse(_) => RPC_S_CANT_CREATE_ENDPOINT,
            RpcError::UnknownInterface(_) => RPC_S_UNKNOWN_IF,
            RpcError::AlreadyRegistered(_) => RPC_S_ALREADY_REGISTERED,
            RpcError::UnknownManagerType(_) => RPC_S_UNKNOWN_MGR_TYPE,
            RpcError::OperationUnavailable(_) => RPC_S_PROCNUM_OUT_OF_RANGE,
            RpcError::NotListening | RpcError::DirectoryUnavailable(_) => RPC_S_NOT_LISTENING,
            RpcError::AlreadyListening => RPC_S_ALREADY_LISTENING,
            RpcError::EptNotRegistered(_) => EPT_S_NOT_REGISTERED,
            RpcError::CallFailed => RPC_S_CALL_FAILED,
            RpcError::Fault(code) => *code,
        }
    }

    /// True for errors after which the underlying connection must not be reused
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_)
                | RpcError::ConnectionClosed
                | RpcError::Protocol(_)
                | RpcError::ShortRead { .. }
                | RpcError::UnexpectedPacketType { .. }
                | RpcError::VersionMismatch { .. }
                | RpcError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
