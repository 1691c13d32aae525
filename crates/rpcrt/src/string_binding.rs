//! String binding compose/parse
//!
//! Format: `[object-uuid@]protseq:network-addr[endpoint]`, for example
//! `ncacn_ip_tcp:127.0.0.1[4711]` or
//! `6d3f4a8b-0000-0000-0000-000000000001@ncalrpc:[OLE1234]`.

use crate::error::{Result, RpcError};
use crate::uuid::Uuid;

/// Parsed string binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringBinding {
    pub object: Uuid,
    pub protseq: String,
    pub network_addr: String,
    pub endpoint: String,
}

/// Compose a string binding from its parts
pub fn compose_string_binding(
    object: Option<&Uuid>,
    protseq: &str,
    network_addr: &str,
    endpoint: &str,
) -> String {
    let mut s = String::new();
    if let Some(object) = object.filter(|o| !o.is_nil()) {
        s.push_str(&object.to_string());
        s.push('@');
    }
    s.push_str(protseq);
    s.push(':');
    s.push_str(network_addr);
    if !endpoint.is_empty() {
        s.push('[');
        s.push_str(endpoint);
        s.push(']');
    }
    s
}

/// Parse a string binding
pub fn parse_string_binding(s: &str) -> Result<StringBinding> {
    let invalid = || RpcError::InvalidStringBinding(s.to_string());

    let (object, rest) = match s.split_once('@') {
        Some((uuid, rest)) => (Uuid::parse(uuid).ok_or_else(invalid)?, rest),
        None => (Uuid::NIL, s),
    };
    let (protseq, rest) = rest.split_once(':').ok_or_else(invalid)?;
    if protseq.is_empty() {
        return Err(invalid());
    }

    let (network_addr, endpoint) = match rest.find('[') {
        Some(open) => {
            let inner = rest[open + 1..].strip_suffix(']').ok_or_else(invalid)?;
            // endpoint options after a comma are accepted and ignored
            let endpoint = inner.split(',').next().unwrap_or_default();
            (&rest[..open], endpoint)
        }
        None => (rest, ""),
    };

    Ok(StringBinding {
        object,
        protseq: protseq.to_string(),
        network_addr: network_addr.to_string(),
        endpoint: endpoint.to_string(),
    })
}
