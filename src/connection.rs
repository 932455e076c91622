//! Pool-managed connections and the factory that establishes them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, HeaderValue};
use http::{Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::connector::{ConnectContext, Connector, Socket, TcpConnector};
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::request::Request;
use crate::response::{Response, ResponseBody};
use crate::timeout::{
    TransferDeadline, before_deadline, connect_timeout_error, display_address, tls_timeout_error,
    within,
};
use crate::util::{Authority, origin_form};

/// A live transport to one authority, owned by the pool between exchanges.
#[async_trait]
pub trait Connection: Send {
    /// Performs one request/response exchange.
    ///
    /// Failures that happen before any request byte was written must be
    /// reported as [`Error::Unprocessed`].
    async fn send(&mut self, request: Request, cancellation: &CancellationToken)
    -> Result<Response>;

    fn is_closed(&self) -> bool;

    fn close(&mut self);

    fn protocol_version(&self) -> Version;

    fn local_address(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        request: &Request,
        cancellation: &CancellationToken,
    ) -> Result<Box<dyn Connection>>;
}

/// Connects through a [`Connector`] and speaks HTTP/1.1 over the result.
///
/// Connect and TLS phases run under the request's own budgets; expiry yields a
/// phase-specific [`Error::Timeout`].
#[derive(Clone)]
pub struct DefaultConnectionFactory {
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for DefaultConnectionFactory {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DefaultConnectionFactory")
            .finish_non_exhaustive()
    }
}

impl DefaultConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn try_default() -> Result<Self> {
        Ok(Self::new(Arc::new(TcpConnector::try_new()?)))
    }
}

fn tls_failure(authority: &Authority, remote: Option<SocketAddr>, source: io::Error) -> Error {
    let message = if source.kind() == io::ErrorKind::UnexpectedEof {
        format!(
            "Connection to '{authority}' @ '{}' closed during TLS handshake",
            display_address(remote)
        )
    } else {
        format!(
            "TLS handshake with '{authority}' @ '{}' failed: {source}",
            display_address(remote)
        )
    };
    Error::socket(TransportErrorKind::Tls, message, source)
}

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    async fn create(
        &self,
        request: &Request,
        cancellation: &CancellationToken,
    ) -> Result<Box<dyn Connection>> {
        let authority = request.authority()?;
        let context = ConnectContext {
            connect_timeout: request.tcp_connect_timeout(),
            tls_handshake_timeout: request.tls_handshake_timeout(),
        };

        let socket = within(
            context.connect_timeout,
            cancellation,
            async {
                self.connector
                    .connect(&authority, &context, cancellation)
                    .await
                    .map_err(|source| {
                        Error::socket(
                            TransportErrorKind::Connect,
                            format!("Connection to '{authority}' failed"),
                            source,
                        )
                    })
            },
            || connect_timeout_error(&authority, context.connect_timeout),
        )
        .await?;

        let local = socket.local_address();
        let remote = socket.remote_address();

        let socket = if authority.scheme().is_tls() {
            within(
                context.tls_handshake_timeout,
                cancellation,
                async {
                    self.connector
                        .upgrade_tls(socket, &authority, &context, cancellation)
                        .await
                        .map_err(|source| tls_failure(&authority, remote, source))
                },
                || tls_timeout_error(&authority, remote, context.tls_handshake_timeout),
            )
            .await?
        } else {
            socket
        };

        let connection = Http1Connection::handshake(socket, authority, local, remote).await?;
        Ok(Box::new(connection))
    }
}

/// An HTTP/1.1 connection driven by a background task.
pub struct Http1Connection {
    sender: http1::SendRequest<Full<Bytes>>,
    authority: Authority,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    closing: bool,
}

impl std::fmt::Debug for Http1Connection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Http1Connection")
            .field("authority", &self.authority)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Http1Connection {
    /// Performs the HTTP/1 handshake over an established socket.
    pub async fn handshake(
        socket: Box<dyn Socket>,
        authority: Authority,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<Self> {
        let (sender, driver) = http1::handshake(TokioIo::new(socket))
            .await
            .map_err(|source| {
                Error::socket(
                    TransportErrorKind::Connect,
                    format!("Connection to '{authority}' failed"),
                    source,
                )
            })?;

        let driver_authority = authority.clone();
        tokio::spawn(async move {
            if let Err(error) = driver.await {
                debug!(authority = %driver_authority, error = %error, "connection driver stopped");
            }
        });

        Ok(Self {
            sender,
            authority,
            local,
            remote,
            closing: false,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    fn wire_request(&self, request: &Request) -> Result<http::Request<Full<Bytes>>> {
        let mut builder = http::Request::builder()
            .method(request.method().clone())
            .uri(Uri::from(origin_form(request.uri())))
            .version(Version::HTTP_11);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(
                request
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
            if !headers.contains_key(HOST) {
                let host = self.authority.host_header();
                let value = HeaderValue::from_str(&host).map_err(|source| {
                    Error::InvalidHeaderValue {
                        name: HOST.as_str().to_owned(),
                        source,
                    }
                })?;
                headers.insert(HOST, value);
            }
        }
        builder
            .body(Full::new(request.body().clone()))
            .map_err(|source| Error::RequestBuild { source })
    }

    fn never_sent(&self, source: hyper::Error) -> Error {
        Error::unprocessed(Error::socket(
            TransportErrorKind::Closed,
            format!(
                "Connection to '{}' @ '{}' closed before the request was sent",
                self.authority,
                display_address(self.remote)
            ),
            source,
        ))
    }

    fn exchange_failed(&self, source: hyper::Error) -> Error {
        let kind = if source.is_incomplete_message() || source.is_closed() {
            TransportErrorKind::Closed
        } else if source.is_body_write_aborted() {
            TransportErrorKind::Write
        } else {
            TransportErrorKind::Read
        };
        Error::socket(
            kind,
            format!(
                "Connection to '{}' @ '{}' failed during the exchange: {source}",
                self.authority,
                display_address(self.remote)
            ),
            source,
        )
    }
}

fn asks_to_close(headers: &http::HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

#[async_trait]
impl Connection for Http1Connection {
    async fn send(
        &mut self,
        request: Request,
        cancellation: &CancellationToken,
    ) -> Result<Response> {
        let deadline = TransferDeadline::start(request.transfer_timeout());
        let wire = self.wire_request(&request)?;
        if asks_to_close(request.headers()) {
            self.closing = true;
        }

        let ready = before_deadline(deadline, cancellation, async {
            self.sender.ready().await.map_err(|source| self.never_sent(source))
        })
        .await;
        if let Err(error) = ready {
            self.closing = true;
            return Err(error);
        }

        let exchange = self.sender.try_send_request(wire);
        let head = before_deadline(deadline, cancellation, async {
            exchange.await.map_err(|mut error| match error.take_message() {
                Some(_unsent) => self.never_sent(error.into_error()),
                None => self.exchange_failed(error.into_error()),
            })
        })
        .await;
        let head = match head {
            Ok(head) => head,
            Err(error) => {
                self.closing = true;
                return Err(error);
            }
        };

        let (parts, incoming) = head.into_parts();
        if asks_to_close(&parts.headers) {
            self.closing = true;
        }
        let body = ResponseBody::new(
            incoming
                .map_err(|source| Box::new(source) as BoxError)
                .boxed_unsync(),
            deadline,
            cancellation.clone(),
            request.body_size_limit(),
        );
        debug!(
            authority = %self.authority,
            status = parts.status.as_u16(),
            "response head received"
        );
        Ok(Response::from_parts(
            parts.status,
            parts.version,
            parts.headers,
            body,
        ))
    }

    fn is_closed(&self) -> bool {
        self.closing || self.sender.is_closed()
    }

    fn close(&mut self) {
        self.closing = true;
    }

    fn protocol_version(&self) -> Version {
        Version::HTTP_11
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }
}
