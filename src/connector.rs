//! Transport establishment: plain TCP connects and TLS upgrades.
//!
//! A [`Connector`] only moves bytes. Deadlines are enforced by the caller
//! (see [`crate::connection::DefaultConnectionFactory`]), which drops the
//! returned future when a phase budget or the cancellation token fires.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::error::Error;
use crate::request::{DEFAULT_TCP_CONNECT_TIMEOUT, DEFAULT_TLS_HANDSHAKE_TIMEOUT};
use crate::util::Authority;

/// A bidirectional byte stream a connection can be built on.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_address(&self) -> Option<SocketAddr>;
    fn remote_address(&self) -> Option<SocketAddr>;
}

impl Socket for TcpStream {
    fn local_address(&self) -> Option<SocketAddr> {
        self.local_addr().ok()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl Socket for tokio_rustls::client::TlsStream<Box<dyn Socket>> {
    fn local_address(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_address()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.get_ref().0.remote_address()
    }
}

impl Socket for tokio::io::DuplexStream {
    fn local_address(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

/// The phase budgets that apply while a connection is established.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectContext {
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
}

impl Default for ConnectContext {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TCP_CONNECT_TIMEOUT,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        authority: &Authority,
        context: &ConnectContext,
        cancellation: &CancellationToken,
    ) -> io::Result<Box<dyn Socket>>;

    async fn upgrade_tls(
        &self,
        socket: Box<dyn Socket>,
        authority: &Authority,
        context: &ConnectContext,
        cancellation: &CancellationToken,
    ) -> io::Result<Box<dyn Socket>>;
}

/// Resolves and connects over TCP, upgrading with rustls for `https`.
#[derive(Clone)]
pub struct TcpConnector {
    tls: TlsConnector,
    nodelay: bool,
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TcpConnector")
            .field("nodelay", &self.nodelay)
            .finish_non_exhaustive()
    }
}

impl TcpConnector {
    /// Uses the webpki root store and the ring provider.
    pub fn try_new() -> Result<Self> {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::TlsConfig {
            message: source.to_string(),
        })?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        Ok(Self::with_tls_config(Arc::new(config)))
    }

    pub fn with_tls_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::from(config),
            nodelay: true,
        }
    }

    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        authority: &Authority,
        _context: &ConnectContext,
        _cancellation: &CancellationToken,
    ) -> io::Result<Box<dyn Socket>> {
        let stream = TcpStream::connect((authority.host(), authority.port())).await?;
        stream.set_nodelay(self.nodelay)?;
        debug!(
            authority = %authority,
            local = ?stream.local_addr().ok(),
            remote = ?stream.peer_addr().ok(),
            "tcp connection established"
        );
        Ok(Box::new(stream))
    }

    async fn upgrade_tls(
        &self,
        socket: Box<dyn Socket>,
        authority: &Authority,
        _context: &ConnectContext,
        _cancellation: &CancellationToken,
    ) -> io::Result<Box<dyn Socket>> {
        let server_name = ServerName::try_from(authority.host().to_owned())
            .map_err(|source| io::Error::new(io::ErrorKind::InvalidInput, source))?;
        let stream = self.tls.connect(server_name, socket).await?;
        debug!(authority = %authority, "tls handshake completed");
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn authority(text: &str) -> Authority {
        Authority::from_uri(&text.parse().expect("uri")).expect("authority")
    }

    #[tokio::test]
    async fn tcp_connector_reports_both_endpoints() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buffer = [0_u8; 4];
            stream.read_exact(&mut buffer).await.expect("read");
            buffer
        });

        let connector = TcpConnector::try_new().expect("connector");
        let mut socket = connector
            .connect(
                &authority(&format!("http://{address}/")),
                &ConnectContext::default(),
                &CancellationToken::none(),
            )
            .await
            .expect("connect");

        assert_eq!(socket.remote_address(), Some(address));
        assert!(socket.local_address().is_some());
        socket.write_all(b"ping").await.expect("write");
        assert_eq!(&server.await.expect("server task"), b"ping");
    }

    #[tokio::test]
    async fn refused_connection_surfaces_as_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        drop(listener);

        let connector = TcpConnector::try_new().expect("connector");
        let result = connector
            .connect(
                &authority(&format!("http://{address}/")),
                &ConnectContext::default(),
                &CancellationToken::none(),
            )
            .await;
        assert!(result.is_err());
    }
}
