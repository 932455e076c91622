//! Races between a governed operation, its phase deadline and the request's
//! cancellation token.
//!
//! A deadline firing yields [`Error::Timeout`] for that phase only; the token
//! firing yields [`Error::Cancelled`]. Phases that already completed are not
//! affected by later deadlines.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::error::{Error, TimeoutPhase};
use crate::util::Authority;

/// Runs `future` until it completes or `cancellation` fires.
pub(crate) async fn cancellable<F, T>(cancellation: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    cancellation.check()?;
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

/// Runs `future` under a per-phase budget; `Duration::ZERO` means unbounded.
pub(crate) async fn within<F, T, E>(
    budget: Duration,
    cancellation: &CancellationToken,
    future: F,
    on_expiry: E,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
    E: FnOnce() -> Error,
{
    if budget.is_zero() {
        return cancellable(cancellation, future).await;
    }
    match tokio::time::timeout(budget, cancellable(cancellation, future)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(on_expiry()),
    }
}

/// The absolute deadline of one request/response exchange.
///
/// It starts when the request is handed to the connection and covers the
/// request write, the response head and every body read.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TransferDeadline {
    expires_at: Instant,
    budget: Duration,
}

impl TransferDeadline {
    pub(crate) fn start(budget: Duration) -> Option<Self> {
        if budget.is_zero() {
            return None;
        }
        Some(Self {
            expires_at: Instant::now() + budget,
            budget,
        })
    }

    pub(crate) fn error(&self) -> Error {
        transfer_timeout_error(self.budget)
    }
}

pub(crate) async fn before_deadline<F, T>(
    deadline: Option<TransferDeadline>,
    cancellation: &CancellationToken,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(deadline) = deadline else {
        return cancellable(cancellation, future).await;
    };
    match tokio::time::timeout_at(deadline.expires_at, cancellable(cancellation, future)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(deadline.error()),
    }
}

pub(crate) fn connect_timeout_error(authority: &Authority, budget: Duration) -> Error {
    let timeout_ms = budget.as_millis();
    Error::timeout(
        TimeoutPhase::Connect,
        timeout_ms,
        format!("Connection to '{authority}' timed out, took longer than {timeout_ms} ms"),
    )
}

pub(crate) fn tls_timeout_error(
    authority: &Authority,
    remote: Option<SocketAddr>,
    budget: Duration,
) -> Error {
    let timeout_ms = budget.as_millis();
    Error::timeout(
        TimeoutPhase::TlsHandshake,
        timeout_ms,
        format!(
            "TLS handshake with '{authority}' @ '{}' timed out, took longer than {timeout_ms} ms",
            display_address(remote)
        ),
    )
}

pub(crate) fn transfer_timeout_error(budget: Duration) -> Error {
    let timeout_ms = budget.as_millis();
    Error::timeout(
        TimeoutPhase::Transfer,
        timeout_ms,
        format!("Allowed transfer timeout exceeded, took longer than {timeout_ms} ms"),
    )
}

pub(crate) fn display_address(address: Option<SocketAddr>) -> String {
    address.map_or_else(|| "unknown".to_owned(), |address| address.to_string())
}
