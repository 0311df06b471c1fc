use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::transport::{ConnectOptions, SessionState, Subscription, TransportError};

/// Pluggable pub/sub client.
/// Implementations: NATS over TCP, in-process memory broker (tests, embedding).
pub trait Transport: Send + Sync {
    /// Open a session. Connection happens in the background; observe it via
    /// `Session::state`. Reconnection is the transport's responsibility.
    ///
    /// # Errors
    ///
    /// Returns an error only for options that can never connect (e.g. a
    /// malformed URL).
    fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Session>, TransportError>;
}

/// One logical connection to the broker.
pub trait Session: Send + Sync + fmt::Debug {
    /// Subscribe to an exact channel name.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the session has been closed.
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;

    /// Publish a message. Fire-and-forget: failures are reported on `errors()`.
    fn publish(&self, channel: &str, message: Value);

    /// Connection state updates.
    fn state(&self) -> watch::Receiver<SessionState>;

    /// Asynchronous transport errors.
    fn errors(&self) -> broadcast::Receiver<TransportError>;

    /// Release the connection. Idempotent.
    fn close(&self);
}

/// Process-wide error logger, injected so dispatch and transports stay
/// testable without real log sinks.
pub trait ErrorSink: Send + Sync {
    fn error(&self, message: &str);
}

/// `ErrorSink` that forwards to `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}
