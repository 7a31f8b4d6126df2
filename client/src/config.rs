//! Client configuration.

use std::time::Duration;

use batchline_common::ProtocolTag;

/// Settings for one client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server WebSocket endpoint, e.g. `ws://localhost:5555/ws`.
    pub url: String,
    /// Protocol used to encode requests for the lifetime of the connection.
    pub protocol: ProtocolTag,
    /// Client identity; a random UUID when not set.
    pub identity: Option<String>,
    /// Maximum number of calls in flight over the connection.
    pub max_concurrency: usize,
    /// How long a call waits for its reply.
    pub timeout: Duration,
    /// How long to wait for the handshake acknowledgement.
    pub handshake_timeout: Duration,
    /// Compare the server version with the client version on connect.
    pub check_version: bool,
    /// Skip the status round trip on connect entirely.
    pub ignore_all_checks: bool,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn protocol(mut self, protocol: ProtocolTag) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn ignore_all_checks(mut self, ignore: bool) -> Self {
        self.ignore_all_checks = ignore;
        self
    }

    pub fn check_version(mut self, check: bool) -> Self {
        self.check_version = check;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5555/ws".to_string(),
            protocol: ProtocolTag::Obj,
            identity: None,
            max_concurrency: 1,
            timeout: Duration::from_secs(15 * 60),
            handshake_timeout: Duration::from_secs(10),
            check_version: true,
            ignore_all_checks: false,
        }
    }
}
