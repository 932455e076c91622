use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::Result;
use crate::error::Error;
use crate::util::Authority;

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub const DEFAULT_TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BODY_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// One HTTP request intent.
///
/// `Request` is a plain value: cloning it is how the pipeline guarantees that
/// retries and interceptors never touch the caller's copy. A timeout of
/// [`Duration::ZERO`] disables the deadline for that phase; a timeout that was
/// never set reads as the crate default and can still be filled in by
/// [`crate::SetRequestTimeoutIfUnset`].
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    tcp_connect_timeout: Option<Duration>,
    tls_handshake_timeout: Option<Duration>,
    transfer_timeout: Option<Duration>,
    body_size_limit: usize,
    idempotent: Option<bool>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            tcp_connect_timeout: None,
            tls_handshake_timeout: None,
            transfer_timeout: None,
            body_size_limit: DEFAULT_BODY_SIZE_LIMIT,
            idempotent: None,
        }
    }

    pub fn get(uri: &str) -> Result<Self> {
        Self::try_new(Method::GET, uri)
    }

    pub fn try_new(method: Method, uri: &str) -> Result<Self> {
        let parsed = uri.parse().map_err(|_| Error::InvalidUri {
            uri: uri.to_owned(),
        })?;
        let request = Self::new(method, parsed);
        request.authority()?;
        Ok(request)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    pub fn authority(&self) -> Result<Authority> {
        Authority::from_uri(&self.uri)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn try_set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        self.set_header(name, value);
        Ok(())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        self.tcp_connect_timeout
            .unwrap_or(DEFAULT_TCP_CONNECT_TIMEOUT)
    }

    pub fn set_tcp_connect_timeout(&mut self, timeout: Duration) {
        self.tcp_connect_timeout = Some(timeout);
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        self.tls_handshake_timeout
            .unwrap_or(DEFAULT_TLS_HANDSHAKE_TIMEOUT)
    }

    pub fn set_tls_handshake_timeout(&mut self, timeout: Duration) {
        self.tls_handshake_timeout = Some(timeout);
    }

    pub fn transfer_timeout(&self) -> Duration {
        self.transfer_timeout.unwrap_or(DEFAULT_TRANSFER_TIMEOUT)
    }

    pub fn set_transfer_timeout(&mut self, timeout: Duration) {
        self.transfer_timeout = Some(timeout);
    }

    /// Sets each budget that has not been set explicitly, leaving the others.
    pub(crate) fn fill_unset_timeouts(
        &mut self,
        tcp_connect_timeout: Duration,
        tls_handshake_timeout: Duration,
        transfer_timeout: Duration,
    ) {
        self.tcp_connect_timeout
            .get_or_insert(tcp_connect_timeout);
        self.tls_handshake_timeout
            .get_or_insert(tls_handshake_timeout);
        self.transfer_timeout.get_or_insert(transfer_timeout);
    }

    pub fn body_size_limit(&self) -> usize {
        self.body_size_limit
    }

    pub fn set_body_size_limit(&mut self, limit: usize) {
        self.body_size_limit = limit;
    }

    /// Whether sending the request twice has the effect of sending it once.
    ///
    /// Defaults to the method semantics (GET, HEAD, PUT, DELETE). An
    /// `idempotency-key` header or an explicit [`Request::set_idempotent`]
    /// overrides that.
    pub fn is_idempotent(&self) -> bool {
        if let Some(idempotent) = self.idempotent {
            return idempotent;
        }
        if self.headers.contains_key(IDEMPOTENCY_KEY_HEADER) {
            return true;
        }
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE
        )
    }

    pub fn set_idempotent(&mut self, idempotent: bool) {
        self.idempotent = Some(idempotent);
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.set_body(body);
        self
    }

    pub fn with_tcp_connect_timeout(mut self, timeout: Duration) -> Self {
        self.set_tcp_connect_timeout(timeout);
        self
    }

    pub fn with_tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.set_tls_handshake_timeout(timeout);
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.set_transfer_timeout(timeout);
        self
    }
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName> {
    name.parse()
        .map_err(|source| Error::InvalidHeaderName {
            name: name.to_owned(),
            source,
        })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue> {
    value
        .parse()
        .map_err(|source| Error::InvalidHeaderValue {
            name: name.to_owned(),
            source,
        })
}
