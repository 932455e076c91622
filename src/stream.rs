use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use http::Version;

use crate::Result;
use crate::cancellation::CancellationToken;
use crate::client::DelegateHttpClient;
use crate::error::Error;
use crate::pool::StreamLease;
use crate::request::Request;
use crate::response::Response;
use crate::util::{Authority, lock_unpoisoned};

/// A single request/response exchange on a pooled connection.
///
/// A stream accepts exactly one request. Dropping it unused returns the
/// connection to the pool untouched.
pub struct Stream {
    lease: Mutex<Option<StreamLease>>,
    authority: Authority,
    protocol_version: Version,
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Stream")
            .field("authority", &self.authority)
            .field("protocol_version", &self.protocol_version)
            .field("remote_address", &self.remote_address)
            .field("used", &lock_unpoisoned(&self.lease).is_none())
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(lease: StreamLease) -> Self {
        let authority = lease.authority().clone();
        let (protocol_version, local_address, remote_address) = match lease.connection() {
            Some(connection) => (
                connection.protocol_version(),
                connection.local_address(),
                connection.remote_address(),
            ),
            None => (Version::HTTP_11, None, None),
        };
        Self {
            lease: Mutex::new(Some(lease)),
            authority,
            protocol_version,
            local_address,
            remote_address,
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn protocol_version(&self) -> Version {
        self.protocol_version
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }
}

#[async_trait]
impl DelegateHttpClient for Stream {
    async fn request(&self, request: Request, cancellation: &CancellationToken) -> Result<Response> {
        let mut lease = lock_unpoisoned(&self.lease)
            .take()
            .ok_or(Error::StreamConsumed)?;
        cancellation.check()?;

        let sent = request.clone();
        let mut response = lease.begin()?.send(request, cancellation).await?;
        response.set_request(sent);
        response.attach_lease(lease);
        Ok(response)
    }
}
