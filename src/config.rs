//! Connection engine configuration.

use std::fmt;
use std::time::Duration;

use crate::core::{HubError, HubResult, WebSocketBufferConfig, WsTlsConfig};

/// Path of the hub's websocket API relative to its base URL.
pub const WEBSOCKET_API_PATH: &str = "/api/websocket";

/// Endpoint and credential for one hub. Read-only to the engine.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    endpoint: String,
    access_token: String,
}

impl ConnectionParameters {
    pub fn new(endpoint: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_token: access_token.into(),
        }
    }

    /// Derive the websocket endpoint from an `http(s)://` base URL.
    pub fn from_base_url(base_url: &str, access_token: impl Into<String>) -> HubResult<Self> {
        let base = base_url.trim_end_matches('/');
        let endpoint = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}{WEBSOCKET_API_PATH}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}{WEBSOCKET_API_PATH}")
        } else {
            return Err(HubError::InvalidArgument(format!(
                "base url must start with http:// or https://: {base_url}"
            )));
        };
        Ok(Self::new(endpoint, access_token))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("endpoint", &self.endpoint)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Configuration for a [`HubConnection`](crate::HubConnection).
#[derive(Clone, Debug)]
pub struct HubConfig {
    // Connect / reconnect
    /// Fixed delay between connect attempts.
    pub retry_delay: Duration,
    /// Reconnect automatically after a live session is lost.
    pub auto_reconnect: bool,
    /// Maximum time from transport open to `auth_ok`.
    pub auth_timeout: Duration,

    // Requests
    /// Default deadline for `send`. `None` waits until cancelled or the session ends.
    pub request_timeout: Option<Duration>,
    /// Maximum number of in-flight correlated requests.
    pub max_pending_requests: usize,

    // Keepalive
    /// Interval between application-level pings. `None` disables keepalive.
    pub ping_interval: Option<Duration>,
    /// Maximum time to wait for a pong before the session is considered lost.
    pub pong_timeout: Duration,

    // Channels
    /// Capacity of the event dispatch queue; the newest event is dropped when full.
    pub event_queue_capacity: usize,
    /// Capacity of the connection-state broadcast channel.
    pub state_channel_capacity: usize,

    // Transport
    pub buffers: WebSocketBufferConfig,
    pub tls: WsTlsConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            auto_reconnect: true,
            auth_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            max_pending_requests: 1000,
            ping_interval: Some(Duration::from_secs(30)),
            pong_timeout: Duration::from_secs(10),
            event_queue_capacity: 1024,
            state_channel_capacity: 64,
            buffers: WebSocketBufferConfig::default(),
            tls: WsTlsConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    #[must_use]
    pub fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    #[must_use]
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn state_channel_capacity(mut self, capacity: usize) -> Self {
        self.state_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn buffers(mut self, buffers: WebSocketBufferConfig) -> Self {
        self.buffers = buffers;
        self
    }

    /// Accept self-signed certificates (local installs).
    #[must_use]
    pub fn validate_certs(mut self, validate: bool) -> Self {
        self.tls.validate_certs = validate;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.event_queue_capacity == 0 {
            return Err("event_queue_capacity must be > 0".to_string());
        }
        if self.state_channel_capacity == 0 {
            return Err("state_channel_capacity must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("max_pending_requests must be > 0".to_string());
        }
        if self.auth_timeout.is_zero() {
            return Err("auth_timeout must be > 0".to_string());
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err("request_timeout must be > 0 when set".to_string());
        }
        if let Some(interval) = self.ping_interval {
            if interval.is_zero() {
                return Err("ping_interval must be > 0 when set".to_string());
            }
            if self.pong_timeout.is_zero() {
                return Err("pong_timeout must be > 0".to_string());
            }
        }
        Ok(())
    }
}
