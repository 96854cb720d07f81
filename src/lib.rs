//! # Slotmux
//!
//! Slot-aware command router for Redis and Valkey clusters.
//!
//! Commands are hashed to one of 16384 slots and sent to the master that
//! serves the slot. MOVED and ASK redirects, failovers and resharding are
//! followed transparently within a bounded retry budget. Multi-key
//! commands whose keys span slots (MGET, MSET, DEL, ...) are split per
//! slot and their replies merged back in key order.
//!
//! Two front ends share the routing core:
//!
//! - [`ClusterContext`] - blocking calls and pipelining
//! - [`AsyncClusterContext`] - callbacks run on an attached [`EventAdapter`]
//!
//! ## Features
//!
//! - `tls` - TLS/SSL support via rustls
//!
//! ## Example
//!
//! ```no_run
//! use slotmux::{command, ClusterBuilder, Frame};
//!
//! # fn main() -> slotmux::Result<()> {
//! let mut cluster = ClusterBuilder::new()
//!     .add_nodes("127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002")
//!     .connect()?;
//!
//! cluster.command(&command::mset([("key1", "v1"), ("key2", "v2")]))?;
//! let reply = cluster.command(&command::mget(["key1", "key2"]))?;
//! assert_eq!(
//!     reply,
//!     Frame::Array(vec![Frame::bulk("v1"), Frame::bulk("v2")])
//! );
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub(crate) mod cluster;
pub(crate) mod core;
pub(crate) mod proto;

pub use crate::cluster::{
    classify, key_slot, AsyncClusterContext, Classified, ClusterContext, ClusterEvent,
    CommandKind, EventCallback, KeyPosition, MergeKind, NodeInfo, NodeIterator, NodeRole,
    OpenSlot, RedirectDecision, RouteSource, SlotRange, SLOT_COUNT,
};
pub use crate::core::adapter::{EventAdapter, TokioAdapter};
pub use crate::core::builder::ClusterBuilder;
pub use crate::core::command::{self, Cmd};
pub use crate::core::connect::{ConnectCallback, Connector, NodeAddr, TcpConnector};
pub use crate::core::connection::{AsyncStream, BoxedStream};
pub use crate::core::memory::{Allocator, SystemAllocator};
pub use crate::proto::codec::{Decoder, Encoder};
pub use crate::proto::error::{Error, ErrorKind, LastError, Result};
pub use crate::proto::frame::Frame;

#[cfg(feature = "tls")]
pub use crate::core::{TlsConnector, TlsConnectorInner};
