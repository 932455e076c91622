use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderValue, USER_AGENT};
use tracing::{Instrument, info_span};

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::config::ClientProfile;
use crate::interceptor::{
    ApplicationInterceptor, NetworkInterceptor, SetRequestHeaderIfUnset, SetRequestTimeoutIfUnset,
};
use crate::pool::{ConnectionLimitingPool, ConnectionPool, UnlimitedConnectionPool};
use crate::request::Request;
use crate::response::Response;
use crate::retry::{DEFAULT_RETRY_LIMIT, RetryRequests};
use crate::stream::Stream;

pub const DEFAULT_USER_AGENT: &str = concat!("interlace/", env!("CARGO_PKG_VERSION"));

/// The one capability every layer of the pipeline implements.
///
/// The facade, interceptor chains, the pooled client and a single
/// [`Stream`] all answer a request the same way, so any of them can stand in
/// for another.
#[async_trait]
pub trait DelegateHttpClient: Send + Sync {
    async fn request(&self, request: Request, cancellation: &CancellationToken) -> Result<Response>;
}

/// One application interceptor in front of the next client.
pub struct InterceptedHttpClient {
    next: Arc<dyn DelegateHttpClient>,
    interceptor: Arc<dyn ApplicationInterceptor>,
}

impl std::fmt::Debug for InterceptedHttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InterceptedHttpClient")
            .finish_non_exhaustive()
    }
}

impl InterceptedHttpClient {
    pub fn new(
        next: Arc<dyn DelegateHttpClient>,
        interceptor: Arc<dyn ApplicationInterceptor>,
    ) -> Self {
        Self { next, interceptor }
    }

    /// Wraps `inner` so the first interceptor runs outermost: `[a, b]` around
    /// `inner` behaves as `a(b(inner))`.
    pub fn chain(
        inner: Arc<dyn DelegateHttpClient>,
        interceptors: Vec<Arc<dyn ApplicationInterceptor>>,
    ) -> Arc<dyn DelegateHttpClient> {
        interceptors
            .into_iter()
            .rev()
            .fold(inner, |next, interceptor| {
                Arc::new(Self::new(next, interceptor)) as Arc<dyn DelegateHttpClient>
            })
    }
}

#[async_trait]
impl DelegateHttpClient for InterceptedHttpClient {
    async fn request(&self, request: Request, cancellation: &CancellationToken) -> Result<Response> {
        self.interceptor
            .request(request, cancellation, self.next.as_ref())
            .await
    }
}

/// Acquires a stream from the pool and runs network interceptors around it.
#[derive(Clone)]
pub struct PooledHttpClient {
    pool: Arc<dyn ConnectionPool>,
    network_interceptors: Vec<Arc<dyn NetworkInterceptor>>,
}

impl std::fmt::Debug for PooledHttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PooledHttpClient")
            .field("network_interceptors", &self.network_interceptors.len())
            .finish_non_exhaustive()
    }
}

impl PooledHttpClient {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            pool,
            network_interceptors: Vec::new(),
        }
    }

    /// Returns a client that also runs `interceptor`, inside the ones already
    /// registered.
    pub fn intercept(mut self, interceptor: Arc<dyn NetworkInterceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }
}

#[async_trait]
impl DelegateHttpClient for PooledHttpClient {
    async fn request(&self, request: Request, cancellation: &CancellationToken) -> Result<Response> {
        let stream = self.pool.get_stream(&request, cancellation).await?;
        NetworkChain {
            interceptors: &self.network_interceptors,
            stream: &stream,
        }
        .request(request, cancellation)
        .await
    }
}

struct NetworkChain<'a> {
    interceptors: &'a [Arc<dyn NetworkInterceptor>],
    stream: &'a Stream,
}

#[async_trait]
impl DelegateHttpClient for NetworkChain<'_> {
    async fn request(&self, request: Request, cancellation: &CancellationToken) -> Result<Response> {
        match self.interceptors.split_first() {
            None => self.stream.request(request, cancellation).await,
            Some((interceptor, rest)) => {
                let next = NetworkChain {
                    interceptors: rest,
                    stream: self.stream,
                };
                interceptor
                    .request_via_network(request, cancellation, &next)
                    .await
            }
        }
    }
}

/// The entry point: clones the caller's request and sends it through the
/// configured pipeline.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<dyn DelegateHttpClient>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HttpClient").finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(inner: Arc<dyn DelegateHttpClient>) -> Self {
        Self { inner }
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    pub async fn request(&self, request: &Request) -> Result<Response> {
        self.request_with_cancellation(request, &CancellationToken::none())
            .await
    }

    pub async fn request_with_cancellation(
        &self,
        request: &Request,
        cancellation: &CancellationToken,
    ) -> Result<Response> {
        let span = info_span!(
            "interlace.request",
            method = %request.method(),
            uri = %request.uri()
        );
        self.inner
            .request(request.clone(), cancellation)
            .instrument(span)
            .await
    }
}

#[async_trait]
impl DelegateHttpClient for HttpClient {
    async fn request(&self, request: Request, cancellation: &CancellationToken) -> Result<Response> {
        self.request_with_cancellation(&request, cancellation)
            .await
    }
}

pub struct HttpClientBuilder {
    pool: Option<Arc<dyn ConnectionPool>>,
    application_interceptors: Vec<Arc<dyn ApplicationInterceptor>>,
    network_interceptors: Vec<Arc<dyn NetworkInterceptor>>,
    retry_limit: Option<usize>,
    profile: Option<ClientProfile>,
    default_user_agent: bool,
}

impl std::fmt::Debug for HttpClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClientBuilder")
            .field("custom_pool", &self.pool.is_some())
            .field("application_interceptors", &self.application_interceptors.len())
            .field("network_interceptors", &self.network_interceptors.len())
            .field("retry_limit", &self.retry_limit)
            .field("profile", &self.profile)
            .field("default_user_agent", &self.default_user_agent)
            .finish()
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self {
            pool: None,
            application_interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            retry_limit: None,
            profile: None,
            default_user_agent: true,
        }
    }

    pub fn pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Adds an application interceptor; the first one added runs outermost.
    pub fn intercept(mut self, interceptor: Arc<dyn ApplicationInterceptor>) -> Self {
        self.application_interceptors.push(interceptor);
        self
    }

    pub fn intercept_network(mut self, interceptor: Arc<dyn NetworkInterceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    /// Extra attempts for retryable failures; `0` disables retrying.
    pub fn retry(mut self, retry_limit: usize) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn skip_default_user_agent(mut self) -> Self {
        self.default_user_agent = false;
        self
    }

    pub fn try_build(self) -> Result<HttpClient> {
        let defaults = self.profile.unwrap_or_default().defaults();
        let pool: Arc<dyn ConnectionPool> = match self.pool {
            Some(pool) => pool,
            None => match defaults.connection_limit {
                Some(limit) => Arc::new(
                    ConnectionLimitingPool::try_new(limit)?.with_idle_timeout(defaults.idle_timeout),
                ),
                None => Arc::new(
                    UnlimitedConnectionPool::try_default()?.with_idle_timeout(defaults.idle_timeout),
                ),
            },
        };

        let mut pooled = PooledHttpClient::new(pool);
        for interceptor in self.network_interceptors {
            pooled = pooled.intercept(interceptor);
        }
        if self.default_user_agent {
            pooled = pooled.intercept(Arc::new(SetRequestHeaderIfUnset::new(
                USER_AGENT,
                HeaderValue::from_static(DEFAULT_USER_AGENT),
            )));
        }

        let mut client: Arc<dyn DelegateHttpClient> = Arc::new(pooled);
        let retry_limit = self
            .retry_limit
            .or(self.profile.map(|_| defaults.retry_limit))
            .unwrap_or(DEFAULT_RETRY_LIMIT);
        if retry_limit > 0 {
            client = Arc::new(InterceptedHttpClient::new(
                client,
                Arc::new(RetryRequests::new(retry_limit)),
            ));
        }
        client = InterceptedHttpClient::chain(client, self.application_interceptors);

        // Profile budgets only fill what the request left unset; application
        // interceptors run inside and can still override them.
        if self.profile.is_some() {
            client = Arc::new(InterceptedHttpClient::new(
                client,
                Arc::new(SetRequestTimeoutIfUnset::new(
                    defaults.tcp_connect_timeout,
                    defaults.tls_handshake_timeout,
                    defaults.transfer_timeout,
                )),
            ));
        }

        Ok(HttpClient::new(client))
    }

    pub fn build(self) -> HttpClient {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build interlace http client: {error}"))
    }
}
