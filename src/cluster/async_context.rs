//! Callback-driven cluster context.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::core::adapter::EventAdapter;
use crate::core::command::Cmd;
use crate::core::connect::NodeAddr;
use crate::proto::error::{Error, LastError, Result};
use crate::proto::frame::Frame;

use super::context::{copy_argv, parse_formatted};
use super::iter::NodeIterator;
use super::router::{ClusterOptions, Route, Router};
use super::topology::NodeInfo;

type Callback = Box<dyn FnOnce(&AsyncClusterContext, Result<Frame>) + Send>;

/// An asynchronous connection to a cluster.
///
/// Every command is paired with a callback that runs exactly once on the
/// attached [`EventAdapter`], with either the reply or an error. Failures
/// detected before any I/O (bad arguments, CROSSSLOT, no adapter) are
/// returned from the submitting call instead and the callback is dropped
/// without running.
///
/// Cheap to clone; clones share the same connections and topology.
///
/// # Example
///
/// ```no_run
/// use slotmux::{command, ClusterBuilder};
///
/// # #[tokio::main]
/// # async fn main() -> slotmux::Result<()> {
/// let cluster = ClusterBuilder::new()
///     .add_node("127.0.0.1:7000")
///     .connect_async()
///     .await?;
/// cluster.command(&command::get("key"), |_, reply| {
///     println!("{reply:?}");
/// })?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AsyncClusterContext {
    inner: Arc<Inner>,
}

struct Inner {
    router: Arc<Router>,
    disconnecting: AtomicBool,
}

impl fmt::Debug for AsyncClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncClusterContext")
            .field("router", &self.inner.router)
            .field(
                "disconnecting",
                &self.inner.disconnecting.load(Ordering::Acquire),
            )
            .finish()
    }
}

impl AsyncClusterContext {
    pub(crate) fn new(options: ClusterOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                router: Arc::new(Router::new(options)),
                disconnecting: AtomicBool::new(false),
            }),
        }
    }

    fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Attaches the event loop that runs connections and callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if an adapter is already attached.
    pub fn attach(&self, adapter: Arc<dyn EventAdapter>) -> Result<()> {
        self.router().clear_error();
        self.router().record(self.router().attach(adapter))
    }

    /// Loads the initial topology, unless the builder deferred it to the
    /// first command.
    pub async fn connect(&self) -> Result<()> {
        self.router().clear_error();
        let result = if self.router().options.blocking_initial_update {
            self.router().ensure_topology().await
        } else {
            self.router().adapter().map(|_| ())
        };
        self.router().record(result)
    }

    /// Submits `cmd`; `callback` receives the reply.
    ///
    /// # Errors
    ///
    /// Returns submission failures; the callback is not invoked for them.
    pub fn command<F>(&self, cmd: &Cmd, callback: F) -> Result<()>
    where
        F: FnOnce(&AsyncClusterContext, Result<Frame>) + Send + 'static,
    {
        self.submit(|router| router.prepare(cmd.args()), Box::new(callback))
    }

    /// Like [`AsyncClusterContext::command`] for a raw argument vector.
    pub fn command_argv<A, F>(&self, argv: &[A], callback: F) -> Result<()>
    where
        A: AsRef<[u8]>,
        F: FnOnce(&AsyncClusterContext, Result<Frame>) + Send + 'static,
    {
        self.submit(
            |router| {
                let argv = copy_argv(router.options.allocator.as_ref(), argv)?;
                router.prepare(&argv)
            },
            Box::new(callback),
        )
    }

    /// Like [`AsyncClusterContext::command`] for a RESP-encoded command.
    pub fn formatted_command<F>(&self, buf: &[u8], callback: F) -> Result<()>
    where
        F: FnOnce(&AsyncClusterContext, Result<Frame>) + Send + 'static,
    {
        self.submit(
            |router| router.prepare(&parse_formatted(buf)?),
            Box::new(callback),
        )
    }

    /// Submits `cmd` to `node` without following redirects.
    pub fn command_to_node<F>(&self, node: &NodeAddr, cmd: &Cmd, callback: F) -> Result<()>
    where
        F: FnOnce(&AsyncClusterContext, Result<Frame>) + Send + 'static,
    {
        self.submit(
            |router| router.prepare_for_node(node.clone(), cmd.args()),
            Box::new(callback),
        )
    }

    fn submit(
        &self,
        prepare: impl FnOnce(&Router) -> Result<Route>,
        callback: Callback,
    ) -> Result<()> {
        let router = self.router();
        router.clear_error();
        let accepted = if self.inner.disconnecting.load(Ordering::Acquire) {
            Err(Error::invalid("context is disconnecting"))
        } else {
            router
                .adapter()
                .and_then(|adapter| Ok((adapter, prepare(router)?)))
        };
        let (adapter, route) = router.record(accepted)?;

        let completion = Completion {
            ctx: self.clone(),
            callback: Some(callback),
        };
        let ctx = self.clone();
        adapter.spawn(Box::pin(async move {
            let result = ctx.router().run(route).await;
            completion.complete(result);
        }));
        Ok(())
    }

    /// Runs `cmd` and awaits the reply directly.
    pub async fn send(&self, cmd: &Cmd) -> Result<Frame> {
        let router = self.router();
        router.clear_error();
        let result = match router.prepare(cmd.args()) {
            Ok(route) => router.run(route).await,
            Err(e) => Err(e),
        };
        router.record(result)
    }

    /// Fetches a fresh topology now.
    pub async fn update_slotmap(&self) -> Result<()> {
        let router = self.router();
        router.clear_error();
        let seen = router.route_version();
        router.record(router.refresh(seen).await)
    }

    /// Closes every node connection.
    ///
    /// Commands still in flight complete with [`Error::Closed`]. Once all
    /// connection tasks have stopped, the adapter is detached and
    /// `on_disconnect` runs. Later submissions are rejected.
    pub fn disconnect<F>(&self, on_disconnect: F) -> Result<()>
    where
        F: FnOnce(&AsyncClusterContext) + Send + 'static,
    {
        let router = self.router();
        router.clear_error();
        let adapter = router.record(router.adapter())?;
        if self.inner.disconnecting.swap(true, Ordering::AcqRel) {
            return router.record(Err(Error::invalid("already disconnecting")));
        }

        let ctx = self.clone();
        let detach = adapter.clone();
        adapter.spawn(Box::pin(async move {
            let conns = ctx.router().pool().close_all().await;
            for conn in &conns {
                conn.closed().await;
            }
            detach.detach();
            debug!(connections = conns.len(), "async cluster context disconnected");
            on_disconnect(&ctx);
        }));
        Ok(())
    }

    /// Returns the master currently serving `key`.
    pub fn node_for_key(&self, key: impl AsRef<[u8]>) -> Option<NodeInfo> {
        self.router().topology().node_for_key(key).cloned()
    }

    /// Iterates over the nodes of the current topology.
    pub fn node_iter(&self) -> NodeIterator {
        NodeIterator::new(self.inner.router.clone())
    }

    /// Number of successful topology refreshes.
    pub fn route_version(&self) -> u64 {
        self.router().route_version()
    }

    /// The error of the last failed call or callback.
    pub fn last_error(&self) -> Option<LastError> {
        self.router().last_error()
    }
}

/// Delivers a command's outcome exactly once.
///
/// If the task running the command is dropped first (the event loop shut
/// down), the callback still runs, with [`Error::Closed`].
struct Completion {
    ctx: AsyncClusterContext,
    callback: Option<Callback>,
}

impl Completion {
    fn complete(mut self, result: Result<Frame>) {
        if let Some(callback) = self.callback.take() {
            let result = self.ctx.router().record(result);
            callback(&self.ctx, result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(&self.ctx, Err(Error::Closed));
        }
    }
}
