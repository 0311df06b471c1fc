use std::time::Duration;

use crate::transport::{ConnectOptions, Encoding};

/// Broker URL used when none is configured.
pub const DEFAULT_URL: &str = "nats://localhost:4222";

/// Reconnect attempts used when `retry_attempts` is unset.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;

/// Delay between reconnect attempts used when `retry_delay` is unset.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Server-level configuration consumed at construction.
///
/// Retry settings are passed straight through to the transport; the server
/// itself never retries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfig {
    /// Broker URL. Defaults to [`DEFAULT_URL`].
    pub url: Option<String>,
    /// Maximum consecutive reconnect attempts per session.
    pub retry_attempts: Option<u32>,
    /// Delay between reconnect attempts.
    pub retry_delay: Option<Duration>,
    /// Client name announced to the broker. Session roles are appended.
    pub name: Option<String>,
}

impl ServerConfig {
    /// Returns the effective broker URL.
    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or(DEFAULT_URL)
    }

    /// Builds the transport options shared by both sessions.
    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            url: self.url().to_string(),
            encoding: Encoding::Json,
            max_reconnect_attempts: self.retry_attempts.unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
            reconnect_delay: self.retry_delay.unwrap_or(DEFAULT_RECONNECT_DELAY),
            name: self.name.clone(),
        }
    }
}
