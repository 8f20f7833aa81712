//! Configuration types for the RPC client

use std::time::Duration;

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default timeout applied by [`call`](crate::RpcClient::call).
    /// `None` (or a zero duration) waits forever.
    pub request_timeout: Option<Duration>,

    /// How long [`close`](crate::RpcClient::close) waits for the receive
    /// loop to wind down before giving up on the join.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}
