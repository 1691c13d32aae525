//! IRemUnknown: remote QueryInterface, AddRef and Release

mod client;
pub mod protocol;
mod server;

pub use client::RemUnknownClient;
pub use protocol::{RemInterfaceRef, RemQiResult, REMUNKNOWN_SYNTAX};
pub(crate) use server::remunknown_interface;
