use thiserror::Error as ThisError;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where a transport failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Connect,
    Tls,
    Write,
    Read,
    Closed,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Write => "write",
            Self::Read => "read",
            Self::Closed => "closed",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// The connection phase a deadline belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    TlsHandshake,
    Transfer,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::TlsHandshake => "tls_handshake",
            Self::Transfer => "transfer",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Unprocessed,
    Socket,
    Timeout,
    Cancelled,
    InvalidUri,
    RequestBuild,
    InvalidHeaderName,
    InvalidHeaderValue,
    ReadBody,
    ResponseBodyTooLarge,
    Deserialize,
    StreamConsumed,
    TlsConfig,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Socket => "socket",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidUri => "invalid_uri",
            Self::RequestBuild => "request_build",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Deserialize => "deserialize",
            Self::StreamConsumed => "stream_consumed",
            Self::TlsConfig => "tls_config",
        }
    }
}

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// The request never reached the wire, so it is always safe to send again.
    #[error("request was not processed: {source}")]
    Unprocessed {
        #[source]
        source: Box<Error>,
    },
    /// A transport failure that may have happened after request bytes were written.
    #[error("{message}")]
    Socket {
        kind: TransportErrorKind,
        message: String,
        #[source]
        source: BoxError,
    },
    #[error("{message}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        message: String,
    },
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("response body too large ({actual_bytes} bytes > {limit_bytes} bytes)")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
    #[error("failed to decode response json: {source}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("a stream can only be used for a single request")]
    StreamConsumed,
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unprocessed { .. } => ErrorCode::Unprocessed,
            Self::Socket { .. } => ErrorCode::Socket,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::StreamConsumed => ErrorCode::StreamConsumed,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
        }
    }

    pub(crate) fn unprocessed(source: Error) -> Self {
        Self::Unprocessed {
            source: Box::new(source),
        }
    }

    pub(crate) fn socket(
        kind: TransportErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Socket {
            kind,
            message: message.into(),
            source: source.into(),
        }
    }

    pub(crate) fn timeout(phase: TimeoutPhase, timeout_ms: u128, message: String) -> Self {
        Self::Timeout {
            phase,
            timeout_ms,
            message,
        }
    }

    pub fn is_unprocessed(&self) -> bool {
        matches!(self, Self::Unprocessed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled)
    }

    /// Unwraps any `Unprocessed` layers and returns the underlying failure.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Self::Unprocessed { source } = current {
            current = source;
        }
        current
    }

    pub fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self.root_cause() {
            Self::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn transport_error_kind(&self) -> Option<TransportErrorKind> {
        match self.root_cause() {
            Self::Socket { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
