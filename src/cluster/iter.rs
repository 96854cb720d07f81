//! Iteration over the nodes of the current topology.

use std::sync::Arc;

use super::router::Router;
use super::topology::NodeInfo;

/// Iterator over cluster nodes.
///
/// Yields masters only, or masters each followed by their replicas when
/// replica parsing is enabled. If the topology is refreshed while
/// iterating, the iterator starts over once on the new topology; a second
/// refresh ends the iteration.
#[derive(Debug)]
pub struct NodeIterator {
    router: Arc<Router>,
    route_version: u64,
    nodes: std::vec::IntoIter<NodeInfo>,
    restarted: bool,
}

impl NodeIterator {
    pub(crate) fn new(router: Arc<Router>) -> Self {
        let (route_version, nodes) = router.node_snapshot();
        Self {
            router,
            route_version,
            nodes: nodes.into_iter(),
            restarted: false,
        }
    }
}

impl Iterator for NodeIterator {
    type Item = NodeInfo;

    fn next(&mut self) -> Option<NodeInfo> {
        if self.router.route_version() != self.route_version {
            if self.restarted {
                return None;
            }
            self.restarted = true;
            let (route_version, nodes) = self.router.node_snapshot();
            self.route_version = route_version;
            self.nodes = nodes.into_iter();
        }
        self.nodes.next()
    }
}
