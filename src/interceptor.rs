//! Request/response interceptors.
//!
//! Application interceptors wrap the whole pooled lookup and may call the next
//! client any number of times. Network interceptors run after a connection has
//! been acquired and wrap only the exchange on that [`crate::Stream`].

use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::client::DelegateHttpClient;
use crate::request::{
    DEFAULT_TCP_CONNECT_TIMEOUT, DEFAULT_TLS_HANDSHAKE_TIMEOUT, DEFAULT_TRANSFER_TIMEOUT, Request,
    parse_header_name, parse_header_value,
};
use crate::response::Response;

#[async_trait]
pub trait ApplicationInterceptor: Send + Sync {
    async fn request(
        &self,
        request: Request,
        cancellation: &CancellationToken,
        next: &dyn DelegateHttpClient,
    ) -> Result<Response>;
}

#[async_trait]
pub trait NetworkInterceptor: Send + Sync {
    async fn request_via_network(
        &self,
        request: Request,
        cancellation: &CancellationToken,
        stream: &dyn DelegateHttpClient,
    ) -> Result<Response>;
}

/// Implements both interceptor kinds for types with an
/// `apply(&self, &mut Request)` method.
macro_rules! request_modifier_interceptors {
    ($($modifier:ty),+ $(,)?) => {$(
        #[async_trait]
        impl ApplicationInterceptor for $modifier {
            async fn request(
                &self,
                mut request: Request,
                cancellation: &CancellationToken,
                next: &dyn DelegateHttpClient,
            ) -> Result<Response> {
                self.apply(&mut request);
                next.request(request, cancellation).await
            }
        }

        #[async_trait]
        impl NetworkInterceptor for $modifier {
            async fn request_via_network(
                &self,
                mut request: Request,
                cancellation: &CancellationToken,
                stream: &dyn DelegateHttpClient,
            ) -> Result<Response> {
                self.apply(&mut request);
                stream.request(request, cancellation).await
            }
        }
    )+};
}

/// Overwrites the connect, TLS handshake and transfer budgets of every request.
///
/// As an application interceptor all three phases are governed; as a network
/// interceptor the connection already exists, so only the transfer budget has
/// an effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetRequestTimeout {
    tcp_connect_timeout: Duration,
    tls_handshake_timeout: Duration,
    transfer_timeout: Duration,
}

impl Default for SetRequestTimeout {
    fn default() -> Self {
        Self::new(
            DEFAULT_TCP_CONNECT_TIMEOUT,
            DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            DEFAULT_TRANSFER_TIMEOUT,
        )
    }
}

impl SetRequestTimeout {
    pub fn new(
        tcp_connect_timeout: Duration,
        tls_handshake_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            tcp_connect_timeout,
            tls_handshake_timeout,
            transfer_timeout,
        }
    }

    pub fn tcp_connect_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_connect_timeout = timeout;
        self
    }

    pub fn tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls_handshake_timeout = timeout;
        self
    }

    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    fn apply(&self, request: &mut Request) {
        request.set_tcp_connect_timeout(self.tcp_connect_timeout);
        request.set_tls_handshake_timeout(self.tls_handshake_timeout);
        request.set_transfer_timeout(self.transfer_timeout);
    }
}

/// Supplies connect, TLS handshake and transfer budgets only where the request
/// has not set its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetRequestTimeoutIfUnset {
    tcp_connect_timeout: Duration,
    tls_handshake_timeout: Duration,
    transfer_timeout: Duration,
}

impl SetRequestTimeoutIfUnset {
    pub fn new(
        tcp_connect_timeout: Duration,
        tls_handshake_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            tcp_connect_timeout,
            tls_handshake_timeout,
            transfer_timeout,
        }
    }

    fn apply(&self, request: &mut Request) {
        request.fill_unset_timeouts(
            self.tcp_connect_timeout,
            self.tls_handshake_timeout,
            self.transfer_timeout,
        );
    }
}

#[derive(Clone, Debug)]
pub struct SetRequestHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl SetRequestHeader {
    pub fn new(name: HeaderName, value: HeaderValue) -> Self {
        Self { name, value }
    }

    pub fn try_new(name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(Self::new(name, value))
    }

    fn apply(&self, request: &mut Request) {
        request
            .headers_mut()
            .insert(self.name.clone(), self.value.clone());
    }
}

/// Sets a header only when the request does not carry it yet.
#[derive(Clone, Debug)]
pub struct SetRequestHeaderIfUnset {
    name: HeaderName,
    value: HeaderValue,
}

impl SetRequestHeaderIfUnset {
    pub fn new(name: HeaderName, value: HeaderValue) -> Self {
        Self { name, value }
    }

    pub fn try_new(name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(Self::new(name, value))
    }

    fn apply(&self, request: &mut Request) {
        if !request.headers().contains_key(&self.name) {
            request
                .headers_mut()
                .insert(self.name.clone(), self.value.clone());
        }
    }
}

#[derive(Clone, Debug)]
pub struct AddRequestHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl AddRequestHeader {
    pub fn new(name: HeaderName, value: HeaderValue) -> Self {
        Self { name, value }
    }

    pub fn try_new(name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(Self::new(name, value))
    }

    fn apply(&self, request: &mut Request) {
        request
            .headers_mut()
            .append(self.name.clone(), self.value.clone());
    }
}

#[derive(Clone, Debug)]
pub struct RemoveRequestHeader {
    name: HeaderName,
}

impl RemoveRequestHeader {
    pub fn new(name: HeaderName) -> Self {
        Self { name }
    }

    pub fn try_new(name: &str) -> Result<Self> {
        Ok(Self::new(parse_header_name(name)?))
    }

    fn apply(&self, request: &mut Request) {
        request.headers_mut().remove(&self.name);
    }
}

request_modifier_interceptors!(
    SetRequestTimeout,
    SetRequestTimeoutIfUnset,
    SetRequestHeader,
    SetRequestHeaderIfUnset,
    AddRequestHeader,
    RemoveRequestHeader,
);

/// Runs a closure over every request before forwarding it.
pub struct ModifyRequest<F> {
    modify: F,
}

impl<F> ModifyRequest<F>
where
    F: Fn(&mut Request) + Send + Sync,
{
    pub fn new(modify: F) -> Self {
        Self { modify }
    }
}

impl<F> std::fmt::Debug for ModifyRequest<F> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ModifyRequest").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> ApplicationInterceptor for ModifyRequest<F>
where
    F: Fn(&mut Request) + Send + Sync,
{
    async fn request(
        &self,
        mut request: Request,
        cancellation: &CancellationToken,
        next: &dyn DelegateHttpClient,
    ) -> Result<Response> {
        (self.modify)(&mut request);
        next.request(request, cancellation).await
    }
}

#[async_trait]
impl<F> NetworkInterceptor for ModifyRequest<F>
where
    F: Fn(&mut Request) + Send + Sync,
{
    async fn request_via_network(
        &self,
        mut request: Request,
        cancellation: &CancellationToken,
        stream: &dyn DelegateHttpClient,
    ) -> Result<Response> {
        (self.modify)(&mut request);
        stream.request(request, cancellation).await
    }
}

/// Runs a closure over every successful response before returning it.
pub struct ModifyResponse<F> {
    modify: F,
}

impl<F> ModifyResponse<F>
where
    F: Fn(&mut Response) + Send + Sync,
{
    pub fn new(modify: F) -> Self {
        Self { modify }
    }
}

impl<F> std::fmt::Debug for ModifyResponse<F> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ModifyResponse").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> ApplicationInterceptor for ModifyResponse<F>
where
    F: Fn(&mut Response) + Send + Sync,
{
    async fn request(
        &self,
        request: Request,
        cancellation: &CancellationToken,
        next: &dyn DelegateHttpClient,
    ) -> Result<Response> {
        let mut response = next.request(request, cancellation).await?;
        (self.modify)(&mut response);
        Ok(response)
    }
}

#[async_trait]
impl<F> NetworkInterceptor for ModifyResponse<F>
where
    F: Fn(&mut Response) + Send + Sync,
{
    async fn request_via_network(
        &self,
        request: Request,
        cancellation: &CancellationToken,
        stream: &dyn DelegateHttpClient,
    ) -> Result<Response> {
        let mut response = stream.request(request, cancellation).await?;
        (self.modify)(&mut response);
        Ok(response)
    }
}

#[derive(Clone, Debug)]
pub struct SetResponseHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl SetResponseHeader {
    pub fn new(name: HeaderName, value: HeaderValue) -> Self {
        Self { name, value }
    }

    pub fn try_new(name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(Self::new(name, value))
    }

    fn apply(&self, response: &mut Response) {
        response
            .headers_mut()
            .insert(self.name.clone(), self.value.clone());
    }
}

#[async_trait]
impl ApplicationInterceptor for SetResponseHeader {
    async fn request(
        &self,
        request: Request,
        cancellation: &CancellationToken,
        next: &dyn DelegateHttpClient,
    ) -> Result<Response> {
        let mut response = next.request(request, cancellation).await?;
        self.apply(&mut response);
        Ok(response)
    }
}

#[async_trait]
impl NetworkInterceptor for SetResponseHeader {
    async fn request_via_network(
        &self,
        request: Request,
        cancellation: &CancellationToken,
        stream: &dyn DelegateHttpClient,
    ) -> Result<Response> {
        let mut response = stream.request(request, cancellation).await?;
        self.apply(&mut response);
        Ok(response)
    }
}
