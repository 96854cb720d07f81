//! Slot-aware routing over a Redis/Valkey cluster.
//!
//! ## Features
//!
//! - **Slot hashing**: CRC16 of the key or its `{hash tag}`
//! - **Topology discovery**: `CLUSTER SLOTS` or `CLUSTER NODES`, swapped in whole
//! - **Redirect handling**: MOVED refreshes and re-routes, ASK redirects once
//! - **Splitting**: MGET, MSET, DEL, EXISTS, UNLINK and TOUCH across slots
//! - **Two execution models**: blocking [`ClusterContext`] with pipelining,
//!   callback-based [`AsyncClusterContext`]

mod async_context;
mod context;
pub(crate) mod inspect;
mod iter;
mod pool;
pub(crate) mod redirect;
pub(crate) mod router;
pub(crate) mod slot;
mod split;
pub(crate) mod topology;

pub use async_context::AsyncClusterContext;
pub use context::ClusterContext;
pub use inspect::{classify, Classified, CommandKind, KeyPosition, MergeKind};
pub use iter::NodeIterator;
pub use redirect::RedirectDecision;
pub use router::{ClusterEvent, EventCallback};
pub use slot::{key_slot, SLOT_COUNT};
pub use topology::{NodeInfo, NodeRole, OpenSlot, RouteSource, SlotRange};
