use std::convert::Infallible;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::error::{BoxError, Error};
use crate::pool::StreamLease;
use crate::request::Request;
use crate::timeout::{TransferDeadline, before_deadline};

pub(crate) type ResBody = UnsyncBoxBody<Bytes, BoxError>;

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

/// The result of a completed request.
///
/// Status and headers are available as soon as the response head has been
/// read; the body streams afterwards and may fail independently.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    request: Option<Request>,
    body: ResponseBody,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::from_parts(
            status,
            Version::HTTP_11,
            HeaderMap::new(),
            ResponseBody::from_bytes(body.into()),
        )
    }

    pub fn from_parts(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: ResponseBody,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            request: None,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The request that was sent on the wire, after every interceptor ran.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = Some(request);
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub(crate) fn attach_lease(&mut self, lease: StreamLease) {
        self.body.attach_lease(lease);
    }
}

/// A response body that is read at most once.
///
/// Reads observe the transfer deadline and the cancellation token of the
/// request that produced it. The connection the body arrives on goes back to
/// the pool once the body has been read to the end.
pub struct ResponseBody {
    inner: Option<ResBody>,
    deadline: Option<TransferDeadline>,
    cancellation: CancellationToken,
    size_limit: usize,
    received: usize,
    lease: Option<StreamLease>,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseBody")
            .field("finished", &self.inner.is_none())
            .field("received", &self.received)
            .field("size_limit", &self.size_limit)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self::new(
            Empty::new().map_err(map_infallible_to_box_error).boxed_unsync(),
            None,
            CancellationToken::none(),
            usize::MAX,
        )
    }

    pub fn from_bytes(body: Bytes) -> Self {
        Self::new(
            Full::new(body).map_err(map_infallible_to_box_error).boxed_unsync(),
            None,
            CancellationToken::none(),
            usize::MAX,
        )
    }

    pub(crate) fn new(
        inner: ResBody,
        deadline: Option<TransferDeadline>,
        cancellation: CancellationToken,
        size_limit: usize,
    ) -> Self {
        Self {
            inner: Some(inner),
            deadline,
            cancellation,
            size_limit,
            received: 0,
            lease: None,
        }
    }

    fn attach_lease(&mut self, lease: StreamLease) {
        if self.inner.is_none() {
            lease.complete();
            return;
        }
        self.lease = Some(lease);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }

    /// Reads the next chunk, or `None` once the body is complete.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            let Some(inner) = self.inner.as_mut() else {
                return Ok(None);
            };
            let next = before_deadline(self.deadline, &self.cancellation, async {
                Ok(inner.frame().await)
            })
            .await;

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(None) => {
                    self.finish();
                    return Ok(None);
                }
                Ok(Some(Err(source))) => {
                    self.abort();
                    return Err(Error::ReadBody { source });
                }
                Err(error) => {
                    self.abort();
                    return Err(error);
                }
            };

            let Ok(data) = frame.into_data() else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            self.received = self.received.saturating_add(data.len());
            if self.received > self.size_limit {
                let actual_bytes = self.received;
                self.abort();
                return Err(Error::ResponseBodyTooLarge {
                    limit_bytes: self.size_limit,
                    actual_bytes,
                });
            }
            return Ok(Some(data));
        }
    }

    /// Reads the remaining body into memory.
    pub async fn buffer(mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    pub async fn text_lossy(self) -> Result<String> {
        let body = self.buffer().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub async fn json<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let body = self.buffer().await?;
        serde_json::from_slice(&body).map_err(|source| Error::Deserialize { source })
    }

    fn finish(&mut self) {
        self.inner = None;
        if let Some(lease) = self.lease.take() {
            lease.complete();
        }
    }

    fn abort(&mut self) {
        self.inner = None;
        self.lease = None;
    }
}
