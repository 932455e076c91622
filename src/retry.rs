use async_trait::async_trait;
use tracing::warn;

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::client::DelegateHttpClient;
use crate::error::Error;
use crate::interceptor::ApplicationInterceptor;
use crate::request::Request;
use crate::response::Response;

pub const DEFAULT_RETRY_LIMIT: usize = 2;

/// Whether a failed attempt may be sent again.
///
/// A request that never reached the wire is always safe to resend. A transport
/// failure that may have happened after bytes were written is only resent when
/// the request is idempotent. Everything else is final.
pub fn is_retryable(request: &Request, error: &Error) -> bool {
    match error {
        Error::Unprocessed { .. } => true,
        Error::Socket { .. } => request.is_idempotent(),
        _ => false,
    }
}

/// Re-sends failed requests through the rest of the chain, including pool
/// acquisition, up to `retry_limit` extra times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryRequests {
    retry_limit: usize,
}

impl Default for RetryRequests {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_LIMIT)
    }
}

impl RetryRequests {
    pub fn new(retry_limit: usize) -> Self {
        Self { retry_limit }
    }

    pub fn retry_limit(&self) -> usize {
        self.retry_limit
    }
}

#[async_trait]
impl ApplicationInterceptor for RetryRequests {
    async fn request(
        &self,
        request: Request,
        cancellation: &CancellationToken,
        next: &dyn DelegateHttpClient,
    ) -> Result<Response> {
        let mut attempt = 1_usize;
        loop {
            let error = match next.request(request.clone(), cancellation).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if attempt > self.retry_limit || !is_retryable(&request, &error) {
                return Err(error);
            }
            cancellation.check()?;

            warn!(
                attempt = attempt,
                retry_limit = self.retry_limit,
                method = %request.method(),
                uri = %request.uri(),
                error = %error,
                "retrying request"
            );
            attempt += 1;
        }
    }
}
