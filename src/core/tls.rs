use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use super::connect::Connector;
use super::connection::BoxedStream;

/// Internal TLS connector wrapper using rustls.
#[derive(Clone)]
pub struct TlsConnectorInner {
    connector: tokio_rustls::TlsConnector,
}

impl TlsConnectorInner {
    /// Creates a new TLS connector with default secure configuration.
    ///
    /// Uses `webpki-roots` for Mozilla's root certificates and `ring` as the crypto provider.
    pub fn new() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self::from_config(Arc::new(config))
    }

    /// Wraps a caller-provided rustls configuration.
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: tokio_rustls::TlsConnector::from(config),
        }
    }
}

impl Default for TlsConnectorInner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TlsConnectorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnectorInner").finish_non_exhaustive()
    }
}

/// Wraps another [`Connector`] and runs a TLS handshake before any RESP
/// bytes are exchanged.
#[derive(Debug)]
pub struct TlsConnector {
    transport: Arc<dyn Connector>,
    tls: TlsConnectorInner,
}

impl TlsConnector {
    /// Layers TLS over `transport`.
    pub fn new(transport: Arc<dyn Connector>, tls: TlsConnectorInner) -> Self {
        Self { transport, tls }
    }
}

impl Connector for TlsConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = self.transport.connect(host, port).await?;
            let name = ServerName::try_from(host.to_string())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let tls = self.tls.connector.connect(name, stream).await?;
            Ok(Box::new(tls) as BoxedStream)
        })
    }
}
