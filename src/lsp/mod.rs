//! Language Server Protocol proxy core
//!
//! Connections to language servers, the registry that routes files to them,
//! and the dispatcher that turns editor operations into protocol calls.

pub mod connection;
pub mod dispatcher;
pub mod edit;
pub mod errors;
pub mod notifications;
pub mod protocol;
pub mod registry;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use connection::ServerConnection;
pub use dispatcher::CommandDispatcher;
pub use errors::{ProxyError, ProxyResult};
pub use notifications::{NotificationRouter, OutputContext};
pub use protocol::LspProtocol;
pub use registry::ServerRegistry;
pub use types::*;
