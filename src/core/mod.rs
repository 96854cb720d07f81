//! Node connections and the pieces that configure them.
//!
//! ## Modules
//!
//! - [`adapter`] - Event-loop capability for async contexts
//! - [`builder`] - Cluster builder
//! - [`command`] - Command builders
//! - [`connect`] - Transport seam and connection handshake
//! - [`connection`] - Framed single connection
//! - [`memory`] - Allocation handle
//! - [`multiplexed`] - Multiplexed connection for concurrent requests

/// Event-loop adapters.
pub mod adapter;
/// Cluster builder configuration.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Connectors and the connection handshake.
pub mod connect;
/// Low-level connection management.
pub mod connection;
/// Allocation handle.
pub mod memory;
/// Multiplexing logic.
pub mod multiplexed;

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        pub(crate) mod tls;
        pub use tls::{TlsConnector, TlsConnectorInner};
    }
}
