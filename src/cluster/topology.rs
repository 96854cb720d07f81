//! Cluster topology data structures and parsers.
//!
//! A [`Topology`] is the slot table plus the node table, versioned by
//! `route_version`. Refreshes build a complete replacement from a
//! `CLUSTER SLOTS` or `CLUSTER NODES` reply and swap it in whole.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::core::connect::{parse_port, NodeAddr};
use crate::core::memory::{reserve_one, vec_with_capacity, Allocator};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

use super::slot::{key_slot, SLOT_COUNT};

/// Which command a refresh queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteSource {
    /// `CLUSTER SLOTS`.
    #[default]
    Slots,
    /// `CLUSTER NODES`.
    Nodes,
}

/// Role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Serves slots.
    Master,
    /// Replicates a master.
    Replica,
}

/// An inclusive range of hash slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
}

impl SlotRange {
    /// Returns true if the given slot is within this range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// A slot in the middle of a migration, as reported by `CLUSTER NODES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenSlot {
    /// This node is moving `slot` to node `to`.
    Migrating {
        /// The slot.
        slot: u16,
        /// Target node id.
        to: String,
    },
    /// This node is receiving `slot` from node `from`.
    Importing {
        /// The slot.
        slot: u16,
        /// Source node id.
        from: String,
    },
}

/// A cluster member as seen by the last refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Network address.
    pub address: NodeAddr,
    /// Node id, when the reply carried one.
    pub id: Option<String>,
    /// Master or replica.
    pub role: NodeRole,
    /// Owned slot ranges (masters only).
    pub slots: Vec<SlotRange>,
    /// Migrating and importing slots.
    pub open_slots: Vec<OpenSlot>,
    /// Replicas of this master, when replica parsing is enabled.
    pub replicas: Vec<NodeInfo>,
    /// Consecutive failed attempts; reset on success.
    pub failure_count: u32,
}

impl NodeInfo {
    fn new(address: NodeAddr, id: Option<String>, role: NodeRole) -> Self {
        Self {
            address,
            id,
            role,
            slots: Vec::new(),
            open_slots: Vec::new(),
            replicas: Vec::new(),
            failure_count: 0,
        }
    }
}

/// Options that shape how replies are parsed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ParseOptions {
    pub replicas: bool,
    pub open_slots: bool,
}

/// Slot table and node table.
pub struct Topology {
    nodes: BTreeMap<NodeAddr, NodeInfo>,
    table: Vec<Option<Arc<NodeAddr>>>,
    route_version: u64,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("route_version", &self.route_version)
            .finish()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Creates an empty topology at version 0.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            table: Vec::new(),
            route_version: 0,
        }
    }

    /// Number of successful refreshes so far.
    pub fn route_version(&self) -> u64 {
        self.route_version
    }

    /// Returns true before the first successful refresh.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the master serving `slot`, or `None` if it is unmapped.
    pub fn node_for_slot(&self, slot: u16) -> Option<&NodeInfo> {
        let addr = self.table.get(usize::from(slot))?.as_ref()?;
        self.nodes.get(addr.as_ref())
    }

    /// Returns the master serving the slot of `key`.
    pub fn node_for_key(&self, key: impl AsRef<[u8]>) -> Option<&NodeInfo> {
        self.node_for_slot(key_slot(key))
    }

    /// Iterates over all masters in address order.
    pub fn masters(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Returns the master with this address.
    pub fn get(&self, addr: &NodeAddr) -> Option<&NodeInfo> {
        self.nodes.get(addr)
    }

    /// Returns true if `addr` is a master or a known replica.
    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.nodes.contains_key(addr)
            || self
                .nodes
                .values()
                .any(|n| n.replicas.iter().any(|r| &r.address == addr))
    }

    /// Bumps the failure counter of the node at `addr`.
    pub(crate) fn record_failure(&mut self, addr: &NodeAddr) {
        if let Some(node) = self.nodes.get_mut(addr) {
            node.failure_count = node.failure_count.saturating_add(1);
        }
    }

    /// Clears the failure counter of the node at `addr`.
    pub(crate) fn record_success(&mut self, addr: &NodeAddr) {
        if let Some(node) = self.nodes.get_mut(addr) {
            node.failure_count = 0;
        }
    }

    /// Validates `masters` and swaps them in, bumping `route_version`.
    ///
    /// On error the current topology is left untouched.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if no slot is assigned, a range is out of
    ///   bounds, or two nodes claim the same slot
    /// - [`Error::OutOfMemory`] if the new tables cannot be allocated
    pub(crate) fn install(&mut self, alloc: &dyn Allocator, masters: Vec<NodeInfo>) -> Result<u64> {
        let mut table: Vec<Option<Arc<NodeAddr>>> =
            vec_with_capacity(alloc, usize::from(SLOT_COUNT))?;
        table.resize(usize::from(SLOT_COUNT), None);

        let mut nodes = BTreeMap::new();
        let mut assigned = 0usize;
        for mut node in masters {
            let addr = Arc::new(node.address.clone());
            for range in &node.slots {
                if range.start > range.end || range.end >= SLOT_COUNT {
                    return Err(Error::protocol(format!(
                        "invalid slot range {}-{}",
                        range.start, range.end
                    )));
                }
                for slot in range.start..=range.end {
                    let entry = &mut table[usize::from(slot)];
                    if entry.is_some() {
                        return Err(Error::protocol(format!(
                            "different node holds same slot {slot}"
                        )));
                    }
                    *entry = Some(addr.clone());
                    assigned += 1;
                }
            }
            if let Some(old) = self.nodes.get(&node.address) {
                node.failure_count = old.failure_count;
            }
            if nodes.insert(node.address.clone(), node).is_some() {
                return Err(Error::protocol(format!(
                    "duplicate address {addr} in topology"
                )));
            }
        }
        if assigned == 0 {
            return Err(Error::protocol("no slot information"));
        }

        self.nodes = nodes;
        self.table = table;
        self.route_version += 1;
        info!(
            route_version = self.route_version,
            masters = self.nodes.len(),
            slots = assigned,
            "installed cluster topology"
        );
        Ok(self.route_version)
    }
}

/// Parses a topology reply into masters (with replicas attached).
///
/// `queried` is the node the reply came from; empty hosts refer to it.
pub(crate) fn parse_reply(
    source: RouteSource,
    reply: &Frame,
    queried: &NodeAddr,
    opts: ParseOptions,
    alloc: &dyn Allocator,
) -> Result<Vec<NodeInfo>> {
    if let Frame::Error(e) = reply {
        return Err(Error::Server {
            message: String::from_utf8_lossy(e).into_owned(),
        });
    }
    match source {
        RouteSource::Slots => parse_cluster_slots(reply, queried, opts, alloc),
        RouteSource::Nodes => {
            let text = reply
                .as_bytes()
                .ok_or_else(|| Error::protocol("CLUSTER NODES reply must be a string"))?;
            let text = std::str::from_utf8(text)
                .map_err(|_| Error::protocol("CLUSTER NODES reply is not UTF-8"))?;
            parse_cluster_nodes(text, queried, opts, alloc)
        }
    }
}

/// Parses a `CLUSTER SLOTS` reply. Any malformed entry fails the whole parse.
fn parse_cluster_slots(
    frame: &Frame,
    queried: &NodeAddr,
    opts: ParseOptions,
    alloc: &dyn Allocator,
) -> Result<Vec<NodeInfo>> {
    let Frame::Array(ranges) = frame else {
        return Err(Error::protocol("CLUSTER SLOTS response must be an array"));
    };
    if ranges.is_empty() {
        return Err(Error::protocol("no slot information"));
    }

    let mut masters: Vec<NodeInfo> = vec_with_capacity(alloc, ranges.len())?;
    let mut index: HashMap<NodeAddr, usize> = HashMap::new();

    for range in ranges {
        let Frame::Array(fields) = range else {
            return Err(Error::protocol("slot range entry is not an array"));
        };
        if fields.len() < 3 {
            return Err(Error::protocol("slot range entry is too short"));
        }
        let start = slot_number(&fields[0])?;
        let end = slot_number(&fields[1])?;
        if start > end {
            return Err(Error::protocol("slot begin is bigger than slot end"));
        }

        let (addr, id) = slots_endpoint(&fields[2], queried)?;
        let at = match index.get(&addr) {
            Some(&at) => at,
            None => {
                reserve_one(alloc, &mut masters)?;
                masters.push(NodeInfo::new(addr.clone(), id, NodeRole::Master));
                index.insert(addr, masters.len() - 1);
                masters.len() - 1
            }
        };
        let master = &mut masters[at];
        reserve_one(alloc, &mut master.slots)?;
        master.slots.push(SlotRange { start, end });

        for replica in &fields[3..] {
            let (addr, id) = slots_endpoint(replica, queried)?;
            if opts.replicas && !master.replicas.iter().any(|r| r.address == addr) {
                reserve_one(alloc, &mut master.replicas)?;
                master
                    .replicas
                    .push(NodeInfo::new(addr, id, NodeRole::Replica));
            }
        }
    }
    Ok(masters)
}

fn slot_number(frame: &Frame) -> Result<u16> {
    match frame {
        Frame::Integer(n) if (0..i64::from(SLOT_COUNT)).contains(n) => Ok(*n as u16),
        _ => Err(Error::protocol("slot number is not an integer in range")),
    }
}

/// `[host, port, id?, ...]`; a nil or empty host means the queried node.
fn slots_endpoint(frame: &Frame, queried: &NodeAddr) -> Result<(NodeAddr, Option<String>)> {
    let Frame::Array(fields) = frame else {
        return Err(Error::protocol("node entry is not an array"));
    };
    if fields.len() < 2 {
        return Err(Error::protocol("node entry is too short"));
    }
    let host = match &fields[0] {
        Frame::BulkString(None) | Frame::Null => queried.host.clone(),
        f => match f.as_bytes() {
            Some(b"") => queried.host.clone(),
            Some(b"?") => queried.host.clone(),
            Some(h) => String::from_utf8_lossy(h).into_owned(),
            None => return Err(Error::protocol("invalid node address")),
        },
    };
    let port = match &fields[1] {
        Frame::Integer(p) => u16::try_from(*p).ok().filter(|p| *p != 0),
        _ => None,
    }
    .ok_or_else(|| Error::protocol("invalid port"))?;
    let id = fields
        .get(2)
        .and_then(Frame::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned());
    Ok((NodeAddr::new(host, port), id))
}

/// Parses a `CLUSTER NODES` reply.
///
/// Each line reads
/// `<id> <ip:port@cport[,hostname]> <flags> <master-id> <ping> <pong> <epoch> <link> [slot ...]`.
fn parse_cluster_nodes(
    text: &str,
    queried: &NodeAddr,
    opts: ParseOptions,
    alloc: &dyn Allocator,
) -> Result<Vec<NodeInfo>> {
    let mut masters: Vec<NodeInfo> = Vec::new();
    let mut replicas: Vec<(String, NodeInfo)> = Vec::new();
    let mut ranges = 0usize;

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() < 8 {
            return Err(Error::protocol("mandatory fields missing"));
        }

        let flags: Vec<&str> = fields[2].split(',').collect();
        if flags.contains(&"noaddr") {
            continue;
        }
        let role = if flags.contains(&"master") {
            Some(NodeRole::Master)
        } else if flags.contains(&"slave") {
            Some(NodeRole::Replica)
        } else {
            None
        };
        let role = role.ok_or_else(|| Error::protocol("unknown role"))?;
        if role == NodeRole::Replica && !opts.replicas {
            continue;
        }

        let endpoint = fields[1].split('@').next().unwrap_or_default();
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| Error::protocol("invalid node address"))?;
        let port = parse_port(port).ok_or_else(|| Error::protocol("invalid port"))?;
        let host = if host.is_empty() { queried.host.as_str() } else { host };
        let mut node = NodeInfo::new(
            NodeAddr::new(host, port),
            Some(fields[0].to_string()),
            role,
        );

        if role == NodeRole::Replica {
            reserve_one(alloc, &mut replicas)?;
            replicas.push((fields[3].to_string(), node));
            continue;
        }

        for entry in fields[8..].iter().filter(|e| !e.is_empty()) {
            if let Some(open) = entry.strip_prefix('[') {
                if opts.open_slots {
                    reserve_one(alloc, &mut node.open_slots)?;
                    node.open_slots.push(parse_open_slot(open)?);
                }
                continue;
            }
            let (start, end) = match entry.split_once('-') {
                Some((start, end)) => (parse_slot(start)?, parse_slot(end)?),
                None => {
                    let slot = parse_slot(entry)?;
                    (slot, slot)
                }
            };
            reserve_one(alloc, &mut node.slots)?;
            node.slots.push(SlotRange { start, end });
            ranges += 1;
        }

        if masters.iter().any(|m| m.address == node.address) {
            return Err(Error::protocol(
                "duplicate addresses in cluster nodes response",
            ));
        }
        reserve_one(alloc, &mut masters)?;
        masters.push(node);
    }

    if ranges == 0 {
        return Err(Error::protocol("no slot information"));
    }

    for (master_id, replica) in replicas {
        if let Some(master) = masters
            .iter_mut()
            .find(|m| m.id.as_deref() == Some(master_id.as_str()))
        {
            reserve_one(alloc, &mut master.replicas)?;
            master.replicas.push(replica);
        }
    }
    Ok(masters)
}

fn parse_slot(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .ok()
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or_else(|| Error::protocol(format!("invalid slot {s:?}")))
}

/// `slot->-id]` (migrating) or `slot-<-id]` (importing), leading `[` removed.
fn parse_open_slot(entry: &str) -> Result<OpenSlot> {
    let entry = entry.trim_end_matches(']');
    if let Some((slot, to)) = entry.split_once("->-") {
        return Ok(OpenSlot::Migrating {
            slot: parse_slot(slot)?,
            to: to.to_string(),
        });
    }
    if let Some((slot, from)) = entry.split_once("-<-") {
        return Ok(OpenSlot::Importing {
            slot: parse_slot(slot)?,
            from: from.to_string(),
        });
    }
    Err(Error::protocol(format!("invalid open slot entry [{entry}]")))
}
