//! Client configuration

use std::time::Duration;

/// Reconnect backoff policy
///
/// Delay for attempt `n` is `min(base_delay * factor^n, max_delay)`. The
/// attempt counter resets only when a reconnection succeeds.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// `None` retries indefinitely, which is what a long-lived chat client
    /// wants by default
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay before reconnect attempt `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(128) as i32);
        let millis = self.base_delay.as_millis() as f64 * exp;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Configuration for [`SecureChatClient`](crate::SecureChatClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, derived from the server URL
    pub server_url: String,
    /// Dialing and the authentication handshake each get this long before
    /// the connect attempt fails
    pub connect_timeout: Duration,
    /// How long a `request_public_key` exchange may take before the send
    /// fails with a key-exchange timeout
    pub key_request_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(server_url: impl AsRef<str>) -> Self {
        Self {
            server_url: build_ws_url(server_url.as_ref()),
            connect_timeout: Duration::from_secs(10),
            key_request_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Turn an http(s) server URL into the ws(s) endpoint
pub fn build_ws_url(server_url: &str) -> String {
    let mut url = server_url.trim_end_matches('/').to_string();
    url = url
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    if url.contains("/ws") {
        return url;
    }
    format!("{url}/ws")
}
