//! Interpretation of cluster error replies.
//!
//! Nodes answer with special error replies when a command reaches the
//! wrong place:
//! - `MOVED <slot> <host>:<port>` - the slot has a new owner
//! - `ASK <slot> <host>:<port>` - the slot is migrating, ask once
//! - `TRYAGAIN ...` - multi-key command during resharding
//! - `CLUSTERDOWN ...` - the cluster cannot serve the slot right now

use crate::core::connect::{parse_port, NodeAddr};
use crate::proto::frame::Frame;

use super::slot::SLOT_COUNT;

/// What the router should do with a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDecision {
    /// The reply is final.
    None,
    /// Permanent redirect; the topology is stale.
    Moved {
        /// Slot named by the node.
        slot: u16,
        /// New owner.
        address: NodeAddr,
    },
    /// One-shot redirect during migration; the topology is not stale.
    Ask {
        /// Slot named by the node.
        slot: u16,
        /// Node currently importing the slot.
        address: NodeAddr,
    },
    /// Transient refusal, retry after re-resolving.
    TryAgain,
    /// Cluster down, retry after re-resolving.
    ClusterDown,
}

impl RedirectDecision {
    /// Classifies `reply`, which was sent by `sender`.
    ///
    /// A redirect with an empty host (`MOVED 12 :7001`) points at the
    /// sender's host. Malformed redirects are treated as ordinary errors.
    pub fn from_reply(reply: &Frame, sender: &NodeAddr) -> Self {
        let Frame::Error(msg) = reply else {
            return Self::None;
        };
        let msg = String::from_utf8_lossy(msg);
        let msg = msg.trim();

        if let Some(args) = msg.strip_prefix("MOVED ") {
            if let Some((slot, address)) = parse_target(args, sender) {
                return Self::Moved { slot, address };
            }
        } else if let Some(args) = msg.strip_prefix("ASK ") {
            if let Some((slot, address)) = parse_target(args, sender) {
                return Self::Ask { slot, address };
            }
        } else if msg.starts_with("TRYAGAIN") {
            return Self::TryAgain;
        } else if msg.starts_with("CLUSTERDOWN") {
            return Self::ClusterDown;
        }
        Self::None
    }

    /// Returns true for any decision other than [`RedirectDecision::None`].
    pub fn is_redirect(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Parses `<slot> <host>:<port>`; the last colon separates the port.
fn parse_target(args: &str, sender: &NodeAddr) -> Option<(u16, NodeAddr)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let endpoint = parts.next()?;
    if parts.next().is_some() || slot >= SLOT_COUNT {
        return None;
    }
    let (host, port) = endpoint.rsplit_once(':')?;
    let port = parse_port(port)?;
    let host = if host.is_empty() {
        sender.host.as_str()
    } else {
        host
    };
    Some((slot, NodeAddr::new(host, port)))
}
