use std::time::Duration;

use crate::pool::DEFAULT_IDLE_TIMEOUT;
use crate::request::{
    DEFAULT_TCP_CONNECT_TIMEOUT, DEFAULT_TLS_HANDSHAKE_TIMEOUT, DEFAULT_TRANSFER_TIMEOUT,
};
use crate::retry::DEFAULT_RETRY_LIMIT;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    Standard,
    LowLatency,
    HighThroughput,
}

/// Settings a [`ClientProfile`] applies when the builder is not told otherwise.
///
/// `connection_limit` of `None` means no per-authority limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileDefaults {
    pub retry_limit: usize,
    pub connection_limit: Option<usize>,
    pub tcp_connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub transfer_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Standard => ProfileDefaults {
                retry_limit: DEFAULT_RETRY_LIMIT,
                connection_limit: None,
                tcp_connect_timeout: DEFAULT_TCP_CONNECT_TIMEOUT,
                tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
                transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
            },
            Self::LowLatency => ProfileDefaults {
                retry_limit: 1,
                connection_limit: Some(32),
                tcp_connect_timeout: Duration::from_secs(2),
                tls_handshake_timeout: Duration::from_secs(2),
                transfer_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(30),
            },
            Self::HighThroughput => ProfileDefaults {
                retry_limit: 3,
                connection_limit: Some(256),
                tcp_connect_timeout: Duration::from_secs(10),
                tls_handshake_timeout: Duration::from_secs(10),
                transfer_timeout: Duration::from_secs(60),
                idle_timeout: Duration::from_secs(120),
            },
        }
    }
}
