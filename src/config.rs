use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8188";
pub const DEFAULT_HOST_MARKER: &str = "mentor";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one room session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the backend that issues room credentials
    pub backend_url: String,
    /// Bearer token for the backend, if it wants one
    pub bearer_token: Option<String>,
    /// WebSocket URL of the media relay
    pub relay_url: String,
    /// Display name a guest looks for to find the host's feed
    pub host_marker: String,
    /// Host-only participant poll period
    pub poll_interval: Duration,
    pub keepalive_interval: Duration,
    /// Bound on the relay handshake and on each awaited signaling reply
    pub connect_timeout: Duration,
    pub backend_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            bearer_token: None,
            relay_url: DEFAULT_RELAY_URL.to_string(),
            host_marker: DEFAULT_HOST_MARKER.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn new(backend_url: impl Into<String>, relay_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }

    pub fn with_host_marker(mut self, marker: impl Into<String>) -> Self {
        self.host_marker = marker.into();
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}
