//! `interlace` is an async HTTP/1.1 client built as a pipeline: a facade, a
//! chain of interceptors, and a per-authority connection pool.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use interlace::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder()
//!         .retry(3)
//!         .intercept(Arc::new(SetRequestTimeout::default().transfer_timeout(Duration::from_secs(5))))
//!         .try_build()?;
//!
//!     let request = Request::get("https://example.com/")?;
//!     let response = client.request(&request).await?;
//!     println!("status={}", response.status());
//!     let body = response.into_body().text_lossy().await?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```
//!
//! # Failure model
//!
//! - [`Error::Unprocessed`] means the request never reached the wire; it is
//!   always safe to resend.
//! - [`Error::Socket`] means bytes may have been written; only idempotent
//!   requests are resent.
//! - [`Error::Timeout`] names the phase (connect, TLS handshake, transfer).
//!   Connect and TLS timeouts arrive wrapped in `Unprocessed`; use
//!   [`Error::root_cause`] to reach them.

mod cancellation;
mod client;
mod config;
mod connection;
mod connector;
mod error;
mod interceptor;
mod pool;
mod request;
mod response;
mod retry;
mod stream;
mod timeout;
mod util;

pub use crate::cancellation::{CancellationSource, CancellationToken, SubscriptionId};
pub use crate::client::{
    DEFAULT_USER_AGENT, DelegateHttpClient, HttpClient, HttpClientBuilder, InterceptedHttpClient,
    PooledHttpClient,
};
pub use crate::config::{ClientProfile, ProfileDefaults};
pub use crate::connection::{
    Connection, ConnectionFactory, DefaultConnectionFactory, Http1Connection,
};
pub use crate::connector::{ConnectContext, Connector, Socket, TcpConnector};
pub use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::interceptor::{
    AddRequestHeader, ApplicationInterceptor, ModifyRequest, ModifyResponse, NetworkInterceptor,
    RemoveRequestHeader, SetRequestHeader, SetRequestHeaderIfUnset, SetRequestTimeout,
    SetRequestTimeoutIfUnset, SetResponseHeader,
};
pub use crate::pool::{
    ConnectionLimitingPool, ConnectionPool, DEFAULT_IDLE_TIMEOUT, UnlimitedConnectionPool,
};
pub use crate::request::{
    DEFAULT_BODY_SIZE_LIMIT, DEFAULT_TCP_CONNECT_TIMEOUT, DEFAULT_TLS_HANDSHAKE_TIMEOUT,
    DEFAULT_TRANSFER_TIMEOUT, Request,
};
pub use crate::response::{Response, ResponseBody};
pub use crate::retry::{DEFAULT_RETRY_LIMIT, RetryRequests, is_retryable};
pub use crate::stream::Stream;
pub use crate::util::{Authority, Scheme};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        ApplicationInterceptor, CancellationSource, CancellationToken, ClientProfile,
        ConnectionLimitingPool, ConnectionPool, DelegateHttpClient, Error, ErrorCode, HttpClient,
        HttpClientBuilder, NetworkInterceptor, Request, Response, RetryRequests,
        SetRequestTimeout, TimeoutPhase, TransportErrorKind,
    };
}
