//! Event-loop capability used by the async cluster context.

use std::fmt;

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::proto::error::{Error, Result};

/// Runs the background I/O of async node connections.
///
/// An adapter is attached to an
/// [`AsyncClusterContext`](crate::AsyncClusterContext) once. Every
/// connection's reader and writer, and the disconnect teardown, are
/// scheduled through it.
pub trait EventAdapter: Send + Sync + fmt::Debug {
    /// Schedules `task` on the event loop.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Called once after all connection tasks have stopped.
    fn detach(&self) {}
}

/// Adapter backed by a tokio runtime handle.
#[derive(Debug, Clone)]
pub struct TokioAdapter {
    handle: Handle,
}

impl TokioAdapter {
    /// Wraps an explicit runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::invalid(format!("no tokio runtime: {e}")))
    }
}

impl EventAdapter for TokioAdapter {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }
}
