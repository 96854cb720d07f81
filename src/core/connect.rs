//! Transport seam and per-node connection handshake.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::command;
use super::connection::{BoxedStream, Connection};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Host and port of a cluster node.
///
/// Displays as `host:port` with no brackets, the form nodes use in
/// `MOVED`/`ASK` replies, so it doubles as the node table key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr {
    /// Hostname or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NodeAddr {
    /// Creates an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `[v6]:port` or a bare IPv6 literal where the
    /// last colon separates the port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a missing host, a missing
    /// port or a port outside 1..=65535.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| Error::invalid(format!("invalid address: {s}")))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| Error::invalid(format!("missing port in address: {s}")))?
        };
        if host.is_empty() {
            return Err(Error::invalid(format!("missing host in address: {s}")));
        }
        let port = parse_port(port).ok_or_else(|| Error::invalid(format!("invalid port in address: {s}")))?;
        Ok(Self::new(host, port))
    }
}

/// Parses a port number in 1..=65535.
pub(crate) fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens the byte stream to a node.
///
/// The default is [`TcpConnector`]. Custom connectors let callers run the
/// cluster over other transports, such as in-memory streams in tests.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connects to `host:port`.
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Plain TCP transport with `TCP_NODELAY` set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Callback told about every connection attempt.
pub type ConnectCallback = Arc<dyn Fn(&NodeAddr, std::result::Result<(), &Error>) + Send + Sync>;

/// Everything needed to open and authenticate a node connection.
#[derive(Clone)]
pub(crate) struct ConnectOptions {
    pub connector: Arc<dyn Connector>,
    pub connect_timeout: Option<Duration>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<u32>,
    pub on_connect: Option<ConnectCallback>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("connector", &self.connector)
            .field("connect_timeout", &self.connect_timeout)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Opens a connection to `addr` and runs AUTH and SELECT on it.
///
/// `connect_timeout` bounds the whole sequence, so a node that accepts the
/// connection but never answers the handshake fails with
/// [`Error::Timeout`]. The connect callback, if any, is told about the
/// outcome.
pub(crate) async fn establish(
    opts: &ConnectOptions,
    addr: &NodeAddr,
) -> Result<Connection<BoxedStream>> {
    let result = match opts.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, handshake(opts, addr))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout {
                    address: addr.to_string(),
                })
            }),
        None => handshake(opts, addr).await,
    };
    if let Some(cb) = &opts.on_connect {
        cb(addr, result.as_ref().map(|_| ()));
    }
    match &result {
        Ok(_) => debug!(%addr, "connected to node"),
        Err(e) => warn!(%addr, error = %e, "failed to connect to node"),
    }
    result
}

async fn handshake(opts: &ConnectOptions, addr: &NodeAddr) -> Result<Connection<BoxedStream>> {
    let stream = opts
        .connector
        .connect(&addr.host, addr.port)
        .await
        .map_err(|e| Error::Connect {
        address: addr.to_string(),
        message: e.to_string(),
    })?;

    let mut connection = Connection::new(stream);

    let auth = match (&opts.username, &opts.password) {
        (Some(user), Some(pass)) => Some(command::auth_with_username(user.clone(), pass.clone())),
        (None, Some(pass)) => Some(command::auth(pass.clone())),
        _ => None,
    };
    if let Some(auth) = auth {
        connection.write_frame(&auth.into_frame()).await?;
        if let Frame::Error(e) = connection.read_frame().await? {
            return Err(Error::Auth {
                message: String::from_utf8_lossy(&e).into_owned(),
            });
        }
    }

    if let Some(db) = opts.database {
        connection.write_frame(&command::select(db).into_frame()).await?;
        if let Frame::Error(e) = connection.read_frame().await? {
            return Err(Error::Connect {
                address: addr.to_string(),
                message: String::from_utf8_lossy(&e).into_owned(),
            });
        }
    }

    Ok(connection)
}
