//! Blocking cluster context and its pipeline.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::core::adapter::TokioAdapter;
use crate::core::command::Cmd;
use crate::core::connect::NodeAddr;
use crate::core::memory::{vec_with_capacity, Allocator};
use crate::proto::codec::Decoder;
use crate::proto::error::{Error, LastError, Result};
use crate::proto::frame::Frame;

use super::iter::NodeIterator;
use super::redirect::RedirectDecision;
use super::router::{ClusterOptions, Route, Router};
use super::split::SplitPlan;
use super::topology::NodeInfo;

/// A blocking connection to a cluster.
///
/// Calls block the current thread until the reply arrives. Network I/O
/// runs on a private current-thread runtime that only makes progress
/// inside a call, so the context starts no threads of its own.
///
/// Must not be used from inside an async runtime; use
/// [`AsyncClusterContext`](crate::AsyncClusterContext) there.
///
/// # Example
///
/// ```no_run
/// use slotmux::{command, ClusterBuilder};
///
/// # fn main() -> slotmux::Result<()> {
/// let mut cluster = ClusterBuilder::new()
///     .add_nodes("127.0.0.1:7000,127.0.0.1:7001")
///     .connect()?;
/// cluster.command(&command::set("key", "value"))?;
/// let value = cluster.command(&command::get("key"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ClusterContext {
    router: Arc<Router>,
    pipeline: Pipeline,
    runtime: Runtime,
}

impl ClusterContext {
    pub(crate) fn new(options: ClusterOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let router = Arc::new(Router::new(options));
        router.attach(Arc::new(TokioAdapter::new(runtime.handle().clone())))?;
        let mut ctx = Self {
            router,
            pipeline: Pipeline::default(),
            runtime,
        };
        if ctx.router.options.blocking_initial_update {
            ctx.update_slotmap()?;
        }
        Ok(ctx)
    }

    fn call<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.router.clear_error();
        let result = f(self);
        self.router.record(result)
    }

    /// Sends `cmd` to the node serving its keys and returns the reply.
    ///
    /// Error replies from the server (`-ERR ...`) are returned as
    /// [`Frame::Error`]. Redirects are followed transparently.
    ///
    /// # Errors
    ///
    /// - [`Error::CrossSlot`] if a non-splittable command spans slots
    /// - [`Error::InvalidArgument`] for keyless commands, bad arity, or
    ///   while pipelined replies are outstanding
    /// - [`Error::RetriesExhausted`] after `max_retry` failed attempts
    pub fn command(&mut self, cmd: &Cmd) -> Result<Frame> {
        self.call(|ctx| ctx.execute(cmd.args()))
    }

    /// Like [`ClusterContext::command`] for a raw argument vector.
    pub fn command_argv<A: AsRef<[u8]>>(&mut self, argv: &[A]) -> Result<Frame> {
        self.call(|ctx| {
            let argv = copy_argv(ctx.router.options.allocator.as_ref(), argv)?;
            ctx.execute(&argv)
        })
    }

    /// Like [`ClusterContext::command`] for a RESP-encoded command.
    pub fn formatted_command(&mut self, buf: &[u8]) -> Result<Frame> {
        self.call(|ctx| {
            let argv = parse_formatted(buf)?;
            ctx.execute(&argv)
        })
    }

    /// Sends `cmd` to `node` without following redirects.
    ///
    /// Works for keyless commands such as `DBSIZE` or `PING`.
    pub fn command_to_node(&mut self, node: &NodeAddr, cmd: &Cmd) -> Result<Frame> {
        self.call(|ctx| {
            ctx.check_no_pipeline()?;
            let route = ctx.router.prepare_for_node(node.clone(), cmd.args())?;
            ctx.runtime.block_on(ctx.router.run(route))
        })
    }

    fn execute(&mut self, argv: &[Bytes]) -> Result<Frame> {
        self.check_no_pipeline()?;
        let route = self.router.prepare(argv)?;
        self.runtime.block_on(self.router.run(route))
    }

    fn check_no_pipeline(&self) -> Result<()> {
        if self.pipeline.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid(
                "pipelined replies are pending; read them or reset first",
            ))
        }
    }

    /// Queues `cmd` without waiting for its reply.
    ///
    /// Nothing is sent until [`ClusterContext::get_reply`] runs out of
    /// fetched replies; commands appended between replies are sent with the
    /// next batch. Pipelined commands are not retried on redirects.
    pub fn append_command(&mut self, cmd: &Cmd) -> Result<()> {
        self.call(|ctx| ctx.append(cmd.args()))
    }

    /// Like [`ClusterContext::append_command`] for a raw argument vector.
    pub fn append_argv<A: AsRef<[u8]>>(&mut self, argv: &[A]) -> Result<()> {
        self.call(|ctx| {
            let argv = copy_argv(ctx.router.options.allocator.as_ref(), argv)?;
            ctx.append(&argv)
        })
    }

    /// Like [`ClusterContext::append_command`] for a RESP-encoded command.
    pub fn append_formatted(&mut self, buf: &[u8]) -> Result<()> {
        self.call(|ctx| {
            let argv = parse_formatted(buf)?;
            ctx.append(&argv)
        })
    }

    /// Queues `cmd` for `node`.
    pub fn append_command_to_node(&mut self, node: &NodeAddr, cmd: &Cmd) -> Result<()> {
        self.call(|ctx| {
            let route = ctx.router.prepare_for_node(node.clone(), cmd.args())?;
            ctx.enqueue(route)
        })
    }

    fn append(&mut self, argv: &[Bytes]) -> Result<()> {
        let route = self.router.prepare(argv)?;
        self.enqueue(route)
    }

    fn enqueue(&mut self, route: Route) -> Result<()> {
        self.runtime.block_on(self.router.ensure_topology())?;
        let alloc = self.router.options.allocator.as_ref();
        match route {
            Route::Node { addr, frame } => {
                self.pipeline.reserve(alloc, 1)?;
                self.pipeline.push(Entry::Single, vec![(addr, frame)]);
            }
            Route::Slot { slot, frame } => {
                let addr = self.resolve(slot)?;
                self.pipeline.reserve(alloc, 1)?;
                self.pipeline.push(Entry::Single, vec![(addr, frame)]);
            }
            Route::Split(plan) => {
                let mut sends = vec_with_capacity(alloc, plan.parts.len())?;
                for part in &plan.parts {
                    let addr = self.resolve(part.slot)?;
                    sends.push((addr, Cmd::from_args(part.argv.clone()).into_frame()));
                }
                self.pipeline.reserve(alloc, sends.len())?;
                self.pipeline.push(Entry::Split(plan), sends);
            }
        }
        debug!(queued = self.pipeline.sends.len(), "appended to pipeline");
        Ok(())
    }

    fn resolve(&self, slot: u16) -> Result<NodeAddr> {
        if let Some(addr) = self.router.resolve(slot) {
            return Ok(addr);
        }
        let seen = self.router.route_version();
        self.runtime.block_on(self.router.refresh(seen))?;
        self.router
            .resolve(slot)
            .ok_or(Error::NoRoute { slot })
    }

    /// Returns the next pipelined reply in submission order, or `None`
    /// once every appended command has been answered.
    ///
    /// Whenever no fetched reply is left, everything queued is sent, one
    /// batch per node.
    pub fn get_reply(&mut self) -> Result<Option<Frame>> {
        self.call(|ctx| ctx.next_reply())
    }

    fn next_reply(&mut self) -> Result<Option<Frame>> {
        if self.pipeline.entries.is_empty() {
            return Ok(None);
        }
        if self.pipeline.replies.is_empty() {
            self.flush()?;
        }
        let Some(entry) = self.pipeline.entries.pop_front() else {
            return Ok(None);
        };
        let count = match &entry {
            Entry::Single => 1,
            Entry::Split(plan) => plan.parts.len(),
        };
        let replies = self.pipeline.take_replies(count);

        let mut frames = Vec::with_capacity(replies.len());
        for (addr, reply) in replies {
            let reply = reply?;
            if matches!(
                RedirectDecision::from_reply(&reply, &addr),
                RedirectDecision::Moved { .. }
            ) {
                self.router.mark_stale();
            }
            frames.push(reply);
        }
        match entry {
            Entry::Single => frames.pop().map(Some).ok_or(Error::Closed),
            Entry::Split(plan) => plan
                .merge(self.router.options.allocator.as_ref(), frames)
                .map(Some),
        }
    }

    /// Sends every queued command, grouped per node, and stores the replies.
    fn flush(&mut self) -> Result<()> {
        let alloc = self.router.options.allocator.as_ref();
        let total = self.pipeline.sends.len();
        let mut groups: Vec<(NodeAddr, Vec<usize>, Vec<Frame>)> = Vec::new();
        let mut replies: Vec<Option<(NodeAddr, Result<Frame>)>> = vec_with_capacity(alloc, total)?;
        replies.resize_with(total, || None);
        self.pipeline
            .replies
            .try_reserve(total)
            .map_err(|_| Error::OutOfMemory)?;

        let sends = std::mem::take(&mut self.pipeline.sends);
        for (index, (addr, frame)) in sends.into_iter().enumerate() {
            match groups.iter_mut().find(|(a, _, _)| *a == addr) {
                Some((_, indices, frames)) => {
                    indices.push(index);
                    frames.push(frame);
                }
                None => groups.push((addr, vec![index], vec![frame])),
            }
        }
        debug!(commands = total, nodes = groups.len(), "flushing pipeline");

        let router = &self.router;
        let results = self.runtime.block_on(join_all(groups.iter_mut().map(
            |(addr, _, frames)| router.execute_on_node(addr, std::mem::take(frames)),
        )));

        for ((addr, indices, _), result) in groups.into_iter().zip(results) {
            match result {
                Ok(frames) => {
                    let mut frames = frames.into_iter();
                    for index in indices {
                        replies[index] = Some((addr.clone(), frames.next().ok_or(Error::Closed)));
                    }
                }
                Err(e) => {
                    if !matches!(e, Error::OutOfMemory) {
                        self.router.mark_stale();
                    }
                    for index in indices {
                        replies[index] = Some((addr.clone(), Err(duplicate(&e))));
                    }
                }
            }
        }

        self.pipeline.replies.extend(replies.into_iter().flatten());
        Ok(())
    }

    /// Drops every queued command and unread reply.
    ///
    /// If a pipelined reply showed the topology to be stale, it is
    /// refreshed here.
    pub fn reset(&mut self) -> Result<()> {
        self.call(|ctx| {
            ctx.pipeline = Pipeline::default();
            if ctx.router.take_stale() {
                let seen = ctx.router.route_version();
                ctx.runtime.block_on(ctx.router.refresh(seen))?;
            }
            Ok(())
        })
    }

    /// Fetches a fresh topology now.
    pub fn update_slotmap(&mut self) -> Result<()> {
        self.call(|ctx| {
            let seen = ctx.router.route_version();
            ctx.runtime.block_on(ctx.router.refresh(seen))
        })
    }

    /// Returns the master currently serving `key`.
    pub fn node_for_key(&self, key: impl AsRef<[u8]>) -> Option<NodeInfo> {
        self.router.topology().node_for_key(key).cloned()
    }

    /// Returns the master currently serving `slot`.
    pub fn node_for_slot(&self, slot: u16) -> Option<NodeInfo> {
        self.router.topology().node_for_slot(slot).cloned()
    }

    /// Iterates over the nodes of the current topology.
    pub fn node_iter(&self) -> NodeIterator {
        NodeIterator::new(self.router.clone())
    }

    /// Number of successful topology refreshes.
    pub fn route_version(&self) -> u64 {
        self.router.route_version()
    }

    /// The error of the last failed call, cleared by the next call.
    pub fn last_error(&self) -> Option<LastError> {
        self.router.last_error()
    }
}

enum Entry {
    Single,
    Split(SplitPlan),
}

/// Commands appended but not yet answered.
#[derive(Default)]
struct Pipeline {
    entries: VecDeque<Entry>,
    sends: Vec<(NodeAddr, Frame)>,
    /// Fetched replies not yet handed out, in submission order.
    replies: VecDeque<(NodeAddr, Result<Frame>)>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("entries", &self.entries.len())
            .field("unsent", &self.sends.len())
            .field("fetched", &self.replies.len())
            .finish()
    }
}

impl Pipeline {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Makes room for one entry and `sends` frames so pushing cannot fail.
    fn reserve(&mut self, alloc: &dyn Allocator, sends: usize) -> Result<()> {
        alloc.reserve(std::mem::size_of::<Entry>())?;
        self.entries.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        alloc.reserve(sends * std::mem::size_of::<(NodeAddr, Frame)>())?;
        self.sends.try_reserve(sends).map_err(|_| Error::OutOfMemory)
    }

    fn push(&mut self, entry: Entry, sends: Vec<(NodeAddr, Frame)>) {
        self.entries.push_back(entry);
        self.sends.extend(sends);
    }

    fn take_replies(&mut self, count: usize) -> Vec<(NodeAddr, Result<Frame>)> {
        let count = count.min(self.replies.len());
        self.replies.drain(..count).collect()
    }
}

/// Copies a caller's argument vector, reserving through the allocator.
pub(crate) fn copy_argv<A: AsRef<[u8]>>(alloc: &dyn Allocator, argv: &[A]) -> Result<Vec<Bytes>> {
    let mut out = vec_with_capacity(alloc, argv.len())?;
    for arg in argv {
        let arg = arg.as_ref();
        alloc.reserve(arg.len())?;
        out.push(Bytes::copy_from_slice(arg));
    }
    Ok(out)
}

/// Turns one RESP-encoded command (an array of bulk strings) into argv.
pub(crate) fn parse_formatted(buf: &[u8]) -> Result<Vec<Bytes>> {
    let mut decoder = Decoder::new();
    decoder.append(buf);
    let frame = decoder
        .decode()?
        .ok_or_else(|| Error::invalid("incomplete formatted command"))?;
    if !decoder.is_empty() {
        return Err(Error::invalid("trailing bytes after formatted command"));
    }
    let Frame::Array(items) = frame else {
        return Err(Error::invalid("formatted command must be an array"));
    };
    items
        .into_iter()
        .map(|item| match item {
            Frame::BulkString(Some(arg)) => Ok(arg),
            _ => Err(Error::invalid("formatted command arguments must be bulk strings")),
        })
        .collect()
}

/// Copies a pipeline failure onto every command of the same batch.
fn duplicate(e: &Error) -> Error {
    match e {
        Error::Io { source } => Error::Io {
            source: std::io::Error::new(source.kind(), source.to_string()),
        },
        Error::Connect { address, message } => Error::Connect {
            address: address.clone(),
            message: message.clone(),
        },
        Error::Timeout { address } => Error::Timeout {
            address: address.clone(),
        },
        Error::Auth { message } => Error::Auth {
            message: message.clone(),
        },
        Error::Closed => Error::Closed,
        Error::Protocol { message } => Error::protocol(message.clone()),
        Error::Server { message } => Error::Server {
            message: message.clone(),
        },
        Error::InvalidArgument { message } => Error::invalid(message.clone()),
        Error::NoRoute { slot } => Error::NoRoute { slot: *slot },
        Error::CrossSlot { command } => Error::CrossSlot {
            command: command.clone(),
        },
        Error::ClusterDown => Error::ClusterDown,
        Error::OutOfMemory => Error::OutOfMemory,
        Error::RetriesExhausted { attempts, last } => Error::RetriesExhausted {
            attempts: *attempts,
            last: Box::new(duplicate(last)),
        },
    }
}
