use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::router::{ClusterEvent, ClusterOptions, EventCallback};
use crate::cluster::topology::{ParseOptions, RouteSource};
use crate::cluster::{AsyncClusterContext, ClusterContext};
use crate::core::adapter::TokioAdapter;
use crate::core::connect::{ConnectCallback, ConnectOptions, Connector, NodeAddr, TcpConnector};
use crate::core::memory::{Allocator, SystemAllocator};
use crate::proto::error::{Error, Result};

const DEFAULT_MAX_RETRY: usize = 5;
const MAX_RETRY_LIMIT: usize = 1 << 16;
const DEFAULT_QUEUE_SIZE: usize = 1024;
const DEFAULT_PORT: u16 = 6379;

/// Builder for configuring and creating cluster contexts.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use slotmux::ClusterBuilder;
///
/// # fn main() -> slotmux::Result<()> {
/// let cluster = ClusterBuilder::new()
///     .add_nodes("10.0.0.1:7000,10.0.0.2:7000")
///     .username("app")
///     .password("secret")
///     .connect_timeout(Duration::from_secs(1))
///     .command_timeout(Duration::from_millis(500))
///     .max_retry(3)
///     .connect()?;
/// # Ok(())
/// # }
/// ```
pub struct ClusterBuilder {
    nodes: Vec<String>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    username: Option<String>,
    password: Option<String>,
    database: Option<u32>,
    max_retry: usize,
    use_replicas: bool,
    parse_open_slots: bool,
    route_source: RouteSource,
    tls: bool,
    blocking_initial_update: bool,
    connector: Option<Arc<dyn Connector>>,
    allocator: Option<Arc<dyn Allocator>>,
    event_callback: Option<EventCallback>,
    connect_callback: Option<ConnectCallback>,
    queue_size: usize,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            connect_timeout: None,
            command_timeout: None,
            username: None,
            password: None,
            database: None,
            max_retry: DEFAULT_MAX_RETRY,
            use_replicas: false,
            parse_open_slots: false,
            route_source: RouteSource::Slots,
            tls: false,
            blocking_initial_update: true,
            connector: None,
            allocator: None,
            event_callback: None,
            connect_callback: None,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl fmt::Debug for ClusterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterBuilder")
            .field("nodes", &self.nodes)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_retry", &self.max_retry)
            .field("route_source", &self.route_source)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl ClusterBuilder {
    /// Creates a new [`ClusterBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bootstrap node.
    ///
    /// # Arguments
    ///
    /// * `address` - `host:port`, `[v6]:port`, or a `redis://` / `rediss://` URL
    #[inline]
    pub fn add_node(mut self, address: impl Into<String>) -> Self {
        self.nodes.push(address.into());
        self
    }

    /// Adds a comma-separated list of bootstrap nodes.
    #[inline]
    pub fn add_nodes(mut self, addresses: &str) -> Self {
        self.nodes.extend(
            addresses
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from),
        );
        self
    }

    /// Sets the connection timeout.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for connection establishment
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the per-command timeout.
    ///
    /// A command that times out fails with a connection error and the
    /// node's connection is torn down.
    #[inline]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Sets the username for ACL authentication. Requires a password.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password for authentication.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Selects a database on every new connection.
    #[inline]
    pub fn database(mut self, database: u32) -> Self {
        self.database = Some(database);
        self
    }

    /// Sets how many failed attempts (redirects and connection errors
    /// together) a command may retry. Defaults to 5.
    #[inline]
    pub fn max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Parses replicas and exposes them through the node iterator.
    #[inline]
    pub fn use_replicas(mut self, enabled: bool) -> Self {
        self.use_replicas = enabled;
        self
    }

    /// Records migrating and importing slots from `CLUSTER NODES`.
    #[inline]
    pub fn parse_open_slots(mut self, enabled: bool) -> Self {
        self.parse_open_slots = enabled;
        self
    }

    /// Loads the topology with `CLUSTER SLOTS` (the default).
    #[inline]
    pub fn route_via_slots(mut self) -> Self {
        self.route_source = RouteSource::Slots;
        self
    }

    /// Loads the topology with `CLUSTER NODES`.
    #[inline]
    pub fn route_via_nodes(mut self) -> Self {
        self.route_source = RouteSource::Nodes;
        self
    }

    /// Enables or disables TLS encryption.
    ///
    /// Requires the `tls` feature. A `rediss://` node address also enables it.
    #[inline]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Whether connecting loads the topology right away (the default) or
    /// defers it to the first command.
    #[inline]
    pub fn blocking_initial_update(mut self, enabled: bool) -> Self {
        self.blocking_initial_update = enabled;
        self
    }

    /// Replaces the TCP transport.
    #[inline]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Routes every allocation on the request path through `allocator`.
    #[inline]
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Registers a callback for topology events.
    #[inline]
    pub fn event_callback(mut self, callback: impl Fn(ClusterEvent) + Send + Sync + 'static) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    /// Registers a callback told about each node connection attempt.
    #[inline]
    pub fn connect_callback(
        mut self,
        callback: impl Fn(&NodeAddr, std::result::Result<(), &Error>) + Send + Sync + 'static,
    ) -> Self {
        self.connect_callback = Some(Arc::new(callback));
        self
    }

    /// Sets the maximum number of pending requests per node connection.
    ///
    /// # Arguments
    ///
    /// * `size` - Maximum number of requests (default: 1024)
    #[inline]
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    fn options(self) -> Result<ClusterOptions> {
        if self.nodes.is_empty() {
            return Err(Error::invalid("no cluster nodes given"));
        }
        if self.max_retry > MAX_RETRY_LIMIT {
            return Err(Error::invalid(format!(
                "max_retry must be at most {MAX_RETRY_LIMIT}"
            )));
        }
        if self.queue_size == 0 {
            return Err(Error::invalid("queue_size must be positive"));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(Error::invalid("username given without a password"));
        }

        let mut tls = self.tls;
        let mut seeds: Vec<NodeAddr> = Vec::new();
        for node in &self.nodes {
            let (addr, secure) = parse_seed(node)?;
            tls |= secure;
            if !seeds.contains(&addr) {
                seeds.push(addr);
            }
        }

        let transport = self.connector.unwrap_or_else(|| Arc::new(TcpConnector));
        let connector = wrap_tls(transport, tls)?;

        Ok(ClusterOptions {
            seeds,
            connect: ConnectOptions {
                connector,
                connect_timeout: self.connect_timeout,
                username: self.username,
                password: self.password,
                database: self.database,
                on_connect: self.connect_callback,
            },
            command_timeout: self.command_timeout,
            max_retry: self.max_retry,
            route_source: self.route_source,
            parse: ParseOptions {
                replicas: self.use_replicas,
                open_slots: self.parse_open_slots,
            },
            blocking_initial_update: self.blocking_initial_update,
            allocator: self.allocator.unwrap_or_else(|| Arc::new(SystemAllocator)),
            on_event: self.event_callback,
            queue_size: self.queue_size,
        })
    }

    /// Builds a blocking [`ClusterContext`] and, unless deferred, loads
    /// the topology.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for invalid configuration, before any I/O
    /// - the refresh error if no node answered with a usable topology
    pub fn connect(self) -> Result<ClusterContext> {
        ClusterContext::new(self.options()?)
    }

    /// Builds an [`AsyncClusterContext`] with no adapter attached yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for invalid configuration.
    pub fn build_async(self) -> Result<AsyncClusterContext> {
        Ok(AsyncClusterContext::new(self.options()?))
    }

    /// Builds an [`AsyncClusterContext`] on the current tokio runtime and
    /// connects it.
    pub async fn connect_async(self) -> Result<AsyncClusterContext> {
        let ctx = self.build_async()?;
        ctx.attach(Arc::new(TokioAdapter::current()?))?;
        ctx.connect().await?;
        Ok(ctx)
    }
}

/// Parses a bootstrap address; returns whether it asked for TLS.
fn parse_seed(node: &str) -> Result<(NodeAddr, bool)> {
    if !node.contains("://") {
        return Ok((NodeAddr::parse(node)?, false));
    }
    let url = url::Url::parse(node).map_err(|e| Error::invalid(format!("invalid node URL {node}: {e}")))?;
    let secure = match url.scheme() {
        "redis" => false,
        "rediss" => true,
        other => {
            return Err(Error::invalid(format!(
                "invalid scheme {other}, expected redis:// or rediss://"
            )))
        }
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::invalid(format!("missing host in {node}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port().unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(Error::invalid(format!("invalid port in {node}")));
    }
    Ok((NodeAddr::new(host, port), secure))
}

#[cfg(feature = "tls")]
fn wrap_tls(transport: Arc<dyn Connector>, tls: bool) -> Result<Arc<dyn Connector>> {
    use crate::core::tls::{TlsConnector, TlsConnectorInner};

    if !tls {
        return Ok(transport);
    }
    Ok(Arc::new(TlsConnector::new(transport, TlsConnectorInner::new())))
}

#[cfg(not(feature = "tls"))]
fn wrap_tls(transport: Arc<dyn Connector>, tls: bool) -> Result<Arc<dyn Connector>> {
    if tls {
        return Err(Error::invalid(
            "TLS requested but the `tls` feature is disabled",
        ));
    }
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = ClusterBuilder::new();
        assert!(builder.nodes.is_empty());
        assert_eq!(builder.max_retry, 5);
        assert!(builder.blocking_initial_update);
        assert_eq!(builder.route_source, RouteSource::Slots);
    }

    #[test]
    fn test_add_nodes_splits_list() {
        let builder = ClusterBuilder::new()
            .add_nodes("127.0.0.1:7000, 127.0.0.1:7001,,")
            .add_node("[::1]:7002");
        assert_eq!(
            builder.nodes,
            vec!["127.0.0.1:7000", "127.0.0.1:7001", "[::1]:7002"]
        );
    }

    #[test]
    fn test_options_parses_and_dedups_seeds() {
        let options = ClusterBuilder::new()
            .add_nodes("127.0.0.1:7000,redis://127.0.0.1:7000,redis://[::1]:7001,redis://example.com")
            .options()
            .unwrap();
        assert_eq!(
            options.seeds,
            vec![
                NodeAddr::new("127.0.0.1", 7000),
                NodeAddr::new("::1", 7001),
                NodeAddr::new("example.com", 6379),
            ]
        );
        assert_eq!(options.max_retry, 5);
    }

    #[test]
    fn test_options_rejects_bad_config() {
        let err = ClusterBuilder::new().options().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);

        assert!(ClusterBuilder::new().add_node("nohost").options().is_err());
        assert!(ClusterBuilder::new().add_node("h:0").options().is_err());
        assert!(ClusterBuilder::new().add_node("http://h:1").options().is_err());
        assert!(ClusterBuilder::new()
            .add_node("h:1")
            .max_retry(usize::MAX)
            .options()
            .is_err());
        assert!(ClusterBuilder::new()
            .add_node("h:1")
            .queue_size(0)
            .options()
            .is_err());
    }

    #[cfg(not(feature = "tls"))]
    #[test]
    fn test_tls_without_feature_is_config_error() {
        assert!(ClusterBuilder::new().add_node("h:1").tls(true).options().is_err());
        assert!(ClusterBuilder::new().add_node("rediss://h:1").options().is_err());
    }

    #[test]
    fn test_connect_fails_without_io_on_bad_config() {
        let err = ClusterBuilder::new().connect().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_username_requires_password() {
        let err = ClusterBuilder::new()
            .add_node("127.0.0.1:7000")
            .username("app")
            .options()
            .unwrap_err();
        assert_eq!(err.kind(), crate::proto::error::ErrorKind::Config);

        let options = ClusterBuilder::new()
            .add_node("127.0.0.1:7000")
            .username("app")
            .password("secret")
            .options()
            .unwrap();
        assert_eq!(options.connect.username.as_deref(), Some("app"));
    }
}
