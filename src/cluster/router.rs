//! The routing engine shared by the blocking and async contexts.
//!
//! A logical command moves through resolve, dispatch and reply
//! inspection. MOVED refreshes the topology at most once per command and
//! re-routes; ASK re-sends once with `ASKING` and leaves the topology
//! alone; connection errors count against the same `max_retry` budget as
//! redirects.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::core::adapter::EventAdapter;
use crate::core::command;
use crate::core::connect::{ConnectOptions, NodeAddr};
use crate::core::memory::{vec_with_capacity, AllocatorRef};
use crate::proto::error::{Error, LastError, Result};
use crate::proto::frame::Frame;

use super::inspect::{classify_with, CommandKind};
use super::pool::ConnectionPool;
use super::redirect::RedirectDecision;
use super::split::{self, SplitPlan};
use super::topology::{parse_reply, NodeInfo, ParseOptions, RouteSource, Topology};

/// Topology notifications delivered to the event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterEvent {
    /// A new slot map was installed.
    SlotmapUpdated {
        /// Version of the installed map.
        route_version: u64,
    },
    /// The first slot map was installed; the context can route commands.
    Ready,
}

/// Callback told about topology changes.
pub type EventCallback = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

/// Resolved options of a cluster context.
#[derive(Clone)]
pub(crate) struct ClusterOptions {
    pub seeds: Vec<NodeAddr>,
    pub connect: ConnectOptions,
    pub command_timeout: Option<Duration>,
    pub max_retry: usize,
    pub route_source: RouteSource,
    pub parse: ParseOptions,
    pub blocking_initial_update: bool,
    pub allocator: AllocatorRef,
    pub on_event: Option<EventCallback>,
    pub queue_size: usize,
}

impl fmt::Debug for ClusterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOptions")
            .field("seeds", &self.seeds)
            .field("connect", &self.connect)
            .field("command_timeout", &self.command_timeout)
            .field("max_retry", &self.max_retry)
            .field("route_source", &self.route_source)
            .field("blocking_initial_update", &self.blocking_initial_update)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

/// Where a command goes, decided before any I/O.
#[derive(Debug)]
pub(crate) enum Route {
    /// All keys share one slot.
    Slot { slot: u16, frame: Frame },
    /// Keys span slots; one sub-command per slot.
    Split(SplitPlan),
    /// Caller-chosen node; no redirects are followed.
    Node { addr: NodeAddr, frame: Frame },
}

/// Shared state of one logical cluster connection.
pub(crate) struct Router {
    pub options: ClusterOptions,
    topology: RwLock<Topology>,
    refresh_lock: tokio::sync::Mutex<()>,
    pool: ConnectionPool,
    adapter: OnceLock<Arc<dyn EventAdapter>>,
    last_error: Mutex<Option<LastError>>,
    stale: AtomicBool,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("options", &self.options)
            .field("route_version", &self.route_version())
            .finish_non_exhaustive()
    }
}

impl Router {
    pub(crate) fn new(options: ClusterOptions) -> Self {
        let pool = ConnectionPool::new(
            options.connect.clone(),
            options.command_timeout,
            options.queue_size,
        );
        Self {
            options,
            topology: RwLock::new(Topology::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
            pool,
            adapter: OnceLock::new(),
            last_error: Mutex::new(None),
            stale: AtomicBool::new(false),
        }
    }

    pub(crate) fn topology(&self) -> RwLockReadGuard<'_, Topology> {
        self.topology.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn topology_mut(&self) -> RwLockWriteGuard<'_, Topology> {
        self.topology.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn route_version(&self) -> u64 {
        self.topology().route_version()
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Installs the event adapter. Only the first call succeeds.
    pub(crate) fn attach(&self, adapter: Arc<dyn EventAdapter>) -> Result<()> {
        self.adapter
            .set(adapter)
            .map_err(|_| Error::invalid("an event adapter is already attached"))
    }

    pub(crate) fn adapter(&self) -> Result<Arc<dyn EventAdapter>> {
        self.adapter
            .get()
            .cloned()
            .ok_or_else(|| Error::invalid("no event adapter attached"))
    }

    /// Clears the error slot; called at the start of every public call.
    pub(crate) fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Records the outcome of a public call and passes it through.
    pub(crate) fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.into());
        }
        result
    }

    pub(crate) fn last_error(&self) -> Option<LastError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub(crate) fn take_stale(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }

    /// Classifies `argv` and decides where it goes.
    ///
    /// # Errors
    ///
    /// - [`Error::CrossSlot`] for a non-splittable command spanning slots
    /// - [`Error::InvalidArgument`] for keyless commands and bad arity
    /// - [`Error::OutOfMemory`] if an allocation is refused
    pub(crate) fn prepare(&self, argv: &[Bytes]) -> Result<Route> {
        let alloc = self.options.allocator.as_ref();
        let classified = classify_with(alloc, argv)?;
        if classified.kind != CommandKind::Keyed {
            return Err(Error::invalid(format!(
                "no keys in command {}, send it to a node instead",
                classified.name
            )));
        }
        if let Some(slot) = classified.single_slot() {
            return Ok(Route::Slot {
                slot,
                frame: frame_for(self, argv)?,
            });
        }
        if !classified.splittable {
            return Err(Error::CrossSlot {
                command: classified.name,
            });
        }
        split::plan(alloc, argv, &classified).map(Route::Split)
    }

    /// Builds a route to a caller-chosen node.
    pub(crate) fn prepare_for_node(&self, addr: NodeAddr, argv: &[Bytes]) -> Result<Route> {
        if argv.is_empty() {
            return Err(Error::invalid("empty command"));
        }
        Ok(Route::Node {
            addr,
            frame: frame_for(self, argv)?,
        })
    }

    /// Runs a prepared command to completion.
    pub(crate) async fn run(&self, route: Route) -> Result<Frame> {
        self.ensure_topology().await?;
        match route {
            Route::Slot { slot, frame } => self.execute_slot(slot, frame).await,
            Route::Split(plan) => self.execute_split(plan).await,
            Route::Node { addr, frame } => self
                .execute_on_node(&addr, vec![frame])
                .await?
                .pop()
                .ok_or(Error::Closed),
        }
    }

    /// Performs the deferred initial update if no topology was loaded yet.
    pub(crate) async fn ensure_topology(&self) -> Result<()> {
        if self.route_version() == 0 {
            self.refresh(0).await?;
        }
        Ok(())
    }

    /// Resolves `slot` to a master address.
    pub(crate) fn resolve(&self, slot: u16) -> Option<NodeAddr> {
        self.topology()
            .node_for_slot(slot)
            .map(|node| node.address.clone())
    }

    async fn execute_slot(&self, slot: u16, frame: Frame) -> Result<Frame> {
        let alloc = self.options.allocator.as_ref();
        let mut attempts = 0usize;
        let mut refreshed = false;
        let mut redirect: Option<NodeAddr> = None;
        let mut asking = false;

        loop {
            let seen = self.route_version();
            let addr = match redirect.take() {
                Some(addr) => addr,
                None => match self.resolve(slot) {
                    Some(addr) => addr,
                    None if !refreshed => {
                        refreshed = true;
                        self.refresh(seen).await?;
                        continue;
                    }
                    None => return Err(Error::NoRoute { slot }),
                },
            };

            let mut frames = vec_with_capacity(alloc, 2)?;
            if asking {
                frames.push(command::asking().into_frame());
            }
            frames.push(frame.clone());
            asking = false;

            let failure = match self.execute_on_node(&addr, frames).await {
                Ok(mut replies) => {
                    let reply = replies.pop().ok_or(Error::Closed)?;
                    match RedirectDecision::from_reply(&reply, &addr) {
                        RedirectDecision::None => return Ok(reply),
                        RedirectDecision::Moved { slot, address } => {
                            warn!(slot, from = %addr, to = %address, "MOVED");
                            if !refreshed {
                                refreshed = true;
                                self.refresh_quietly(seen).await?;
                            }
                            redirect = Some(address);
                            server_error(&reply)
                        }
                        RedirectDecision::Ask { slot, address } => {
                            debug!(slot, from = %addr, to = %address, "ASK");
                            redirect = Some(address);
                            asking = true;
                            server_error(&reply)
                        }
                        RedirectDecision::TryAgain => {
                            debug!(slot, %addr, "TRYAGAIN");
                            server_error(&reply)
                        }
                        RedirectDecision::ClusterDown => {
                            warn!(slot, %addr, "CLUSTERDOWN");
                            Error::ClusterDown
                        }
                    }
                }
                Err(e) if e.is_retryable() && !self.pool.is_closed() => {
                    self.refresh_quietly(seen).await?;
                    e
                }
                Err(e) => return Err(e),
            };

            attempts += 1;
            if attempts > self.options.max_retry {
                warn!(slot, attempts, error = %failure, "giving up");
                return Err(Error::RetriesExhausted {
                    attempts,
                    last: Box::new(failure),
                });
            }
        }
    }

    async fn execute_split(&self, plan: SplitPlan) -> Result<Frame> {
        let alloc = self.options.allocator.as_ref();
        let parts = plan
            .parts
            .iter()
            .map(|part| Ok((part.slot, frame_for(self, &part.argv)?)))
            .collect::<Result<Vec<_>>>()?;
        let replies = join_all(
            parts
                .into_iter()
                .map(|(slot, frame)| self.execute_slot(slot, frame)),
        )
        .await;
        let replies = replies.into_iter().collect::<Result<Vec<_>>>()?;
        plan.merge(alloc, replies)
    }

    /// Sends `frames` to `addr` once, with failure bookkeeping.
    pub(crate) async fn execute_on_node(
        &self,
        addr: &NodeAddr,
        frames: Vec<Frame>,
    ) -> Result<Vec<Frame>> {
        let adapter = self.adapter()?;
        let result = self
            .pool
            .dispatch(
                self.options.allocator.as_ref(),
                adapter.as_ref(),
                addr,
                frames,
            )
            .await;
        match &result {
            Ok(_) => self.topology_mut().record_success(addr),
            Err(e) if e.is_retryable() => self.topology_mut().record_failure(addr),
            Err(_) => {}
        }
        result
    }

    /// Refreshes unless another caller already moved past `seen`.
    ///
    /// Known masters are asked first, then the seed nodes.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn refresh(&self, seen: u64) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        if self.route_version() != seen {
            return Ok(());
        }

        let mut candidates: Vec<NodeAddr> = self
            .topology()
            .masters()
            .map(|node| node.address.clone())
            .collect();
        for seed in &self.options.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        let mut last = None;
        for addr in candidates {
            match self.refresh_from(&addr).await {
                Ok(()) => return Ok(()),
                Err(Error::OutOfMemory) => return Err(Error::OutOfMemory),
                Err(e) => {
                    warn!(%addr, error = %e, "topology refresh failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::invalid("no nodes to query")))
    }

    /// Refresh whose failures other than OOM are only logged.
    async fn refresh_quietly(&self, seen: u64) -> Result<()> {
        match self.refresh(seen).await {
            Err(Error::OutOfMemory) => Err(Error::OutOfMemory),
            _ => Ok(()),
        }
    }

    async fn refresh_from(&self, addr: &NodeAddr) -> Result<()> {
        let query = match self.options.route_source {
            RouteSource::Slots => command::cluster_slots(),
            RouteSource::Nodes => command::cluster_nodes(),
        };
        let reply = self
            .execute_on_node(addr, vec![query.into_frame()])
            .await?
            .pop()
            .ok_or(Error::Closed)?;
        let alloc = self.options.allocator.as_ref();
        let masters = parse_reply(
            self.options.route_source,
            &reply,
            addr,
            self.options.parse,
            alloc,
        )?;
        let version = self.topology_mut().install(alloc, masters)?;

        let live: HashSet<NodeAddr> = {
            let topology = self.topology();
            topology
                .masters()
                .flat_map(|m| std::iter::once(m).chain(&m.replicas))
                .map(|n| n.address.clone())
                .collect()
        };
        self.pool.retain(|a| live.contains(a)).await;

        if let Some(cb) = &self.options.on_event {
            cb(ClusterEvent::SlotmapUpdated {
                route_version: version,
            });
            if version == 1 {
                cb(ClusterEvent::Ready);
            }
        }
        Ok(())
    }

    /// Snapshot of the nodes exposed by the node iterator.
    pub(crate) fn node_snapshot(&self) -> (u64, Vec<NodeInfo>) {
        let topology = self.topology();
        let mut nodes = Vec::new();
        for master in topology.masters() {
            nodes.push(master.clone());
            if self.options.parse.replicas {
                nodes.extend(master.replicas.iter().cloned());
            }
        }
        (topology.route_version(), nodes)
    }
}

/// Copies `argv` into a frame, reserving memory through the allocator.
fn frame_for(router: &Router, argv: &[Bytes]) -> Result<Frame> {
    let alloc = router.options.allocator.as_ref();
    let mut items = vec_with_capacity(alloc, argv.len())?;
    items.extend(argv.iter().cloned().map(|arg| Frame::BulkString(Some(arg))));
    Ok(Frame::Array(items))
}

fn server_error(reply: &Frame) -> Error {
    Error::Server {
        message: reply.error_message().unwrap_or_default(),
    }
}
