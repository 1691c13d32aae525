//! Apartments
//!
//! - [`Apartment`]: an OXID with its exported and imported object tables
//! - STA message queue: inbound calls queued to whoever pumps the apartment
//! - Dispatcher: routes inbound calls by IPID to the owning apartment

#[allow(clippy::module_inception)]
mod apartment;
mod dispatcher;
mod sta;

pub use apartment::{Apartment, ApartmentKind};
pub(crate) use dispatcher::{object_interface, target_apartment};
pub use sta::ApartmentMessage;
