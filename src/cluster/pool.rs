//! Per-node connection management.
//!
//! One multiplexed connection per node, opened lazily on first use and
//! reused by every later command. A connection that fails or times out is
//! torn down and reopened by the next command that needs the node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::adapter::EventAdapter;
use crate::core::connect::{establish, ConnectOptions, NodeAddr};
use crate::core::memory::Allocator;
use crate::core::multiplexed::MultiplexedConnection;
use crate::proto::codec::encoded_len;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Connection pool for the nodes of one cluster context.
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    connect: ConnectOptions,
    command_timeout: Option<Duration>,
    queue_size: usize,
    connections: RwLock<HashMap<NodeAddr, MultiplexedConnection>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub(crate) fn new(
        connect: ConnectOptions,
        command_timeout: Option<Duration>,
        queue_size: usize,
    ) -> Self {
        Self {
            connect,
            command_timeout,
            queue_size,
            connections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the live connection to `addr`, opening one if needed.
    async fn get(&self, addr: &NodeAddr, adapter: &dyn EventAdapter) -> Result<MultiplexedConnection> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(conn) = self.connections.read().await.get(addr) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let connection = establish(&self.connect, addr).await?;
        let conn = MultiplexedConnection::new(connection, self.queue_size, adapter);

        let mut conns = self.connections.write().await;
        if self.is_closed() {
            conn.close();
            return Err(Error::Closed);
        }
        match conns.get(addr) {
            Some(existing) if !existing.is_closed() => {
                conn.close();
                Ok(existing.clone())
            }
            _ => {
                conns.insert(addr.clone(), conn.clone());
                Ok(conn)
            }
        }
    }

    /// Sends `frames` to `addr` and returns one reply per frame.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfMemory`] if the encode buffer cannot be reserved;
    ///   nothing has been sent in that case
    /// - any connection-kind error; the node's connection has then been
    ///   dropped
    pub(crate) async fn dispatch(
        &self,
        alloc: &dyn Allocator,
        adapter: &dyn EventAdapter,
        addr: &NodeAddr,
        frames: Vec<Frame>,
    ) -> Result<Vec<Frame>> {
        alloc.reserve(frames.iter().map(encoded_len).sum())?;
        let fut = async {
            let conn = self.get(addr, adapter).await?;
            debug!(%addr, frames = frames.len(), "dispatching");
            conn.send_pipeline(frames).await
        };
        let result = match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout {
                        address: addr.to_string(),
                    })
                }),
            None => fut.await,
        };
        if let Err(e) = &result {
            if e.poisons_connection() {
                warn!(%addr, error = %e, "dropping node connection");
                self.remove(addr).await;
            }
        }
        result
    }

    /// Closes and forgets the connection to `addr`.
    pub(crate) async fn remove(&self, addr: &NodeAddr) {
        if let Some(conn) = self.connections.write().await.remove(addr) {
            conn.close();
        }
    }

    /// Closes connections to nodes for which `keep` returns false.
    pub(crate) async fn retain(&self, keep: impl Fn(&NodeAddr) -> bool) {
        self.connections.write().await.retain(|addr, conn| {
            let keep = keep(addr);
            if !keep {
                debug!(%addr, "closing connection to departed node");
                conn.close();
            }
            keep
        });
    }

    /// Returns true after [`ConnectionPool::close_all`].
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every connection for good and returns the handles so the
    /// caller can wait for their I/O tasks to finish.
    pub(crate) async fn close_all(&self) -> Vec<MultiplexedConnection> {
        self.closed.store(true, Ordering::Release);
        let conns: Vec<_> = self.connections.write().await.drain().map(|(_, c)| c).collect();
        for conn in &conns {
            conn.close();
        }
        conns
    }

    /// Number of open connections.
    pub(crate) async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
