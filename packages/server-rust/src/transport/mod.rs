//! Pub/sub transport abstraction and shared session plumbing.
//!
//! A transport hands out [`Session`](crate::traits::Session)s, each owning one
//! logical broker connection. Sessions publish fire-and-forget, deliver
//! subscribed messages through [`Subscription`]s, expose their connection
//! state through a `watch` channel, and report asynchronous failures through
//! a `broadcast` channel of [`TransportError`]s.

pub mod memory;
pub mod nats;

use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};

pub use memory::MemoryBroker;
pub use nats::NatsTransport;

/// Capacity of the per-session error broadcast channel.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Wire encoding used for message payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Payloads are JSON documents.
    #[default]
    Json,
}

/// Options passed straight through to a transport when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker URL, e.g. `nats://localhost:4222`.
    pub url: String,
    /// Payload encoding.
    pub encoding: Encoding,
    /// How many consecutive failed (re)connect attempts are tolerated before
    /// the session gives up and closes.
    pub max_reconnect_attempts: u32,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Optional client name announced to the broker.
    pub name: Option<String>,
}

/// Connection state of a session.
///
/// State machine: Connecting -> Connected -> Reconnecting -> Connected | Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// First connection attempt in progress.
    Connecting,
    /// Connected to the broker.
    Connected,
    /// Connection lost; the transport is retrying.
    Reconnecting,
    /// Closed locally or after exhausting reconnect attempts. Terminal.
    Closed,
}

/// Transport-level failures. Reported asynchronously through session error
/// events or returned from setup calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid broker url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("i/o error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("broker error: {0}")]
    Server(String),
    #[error("payload encoding error on {channel:?}: {reason}")]
    Encoding { channel: String, reason: String },
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("session is closed")]
    Closed,
}

/// One message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel the message was published on.
    pub channel: String,
    /// Decoded message body.
    pub payload: Value,
}

/// Receiving end of a channel subscription.
///
/// The stream ends when the owning session closes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Creates a subscription fed by `rx`.
    #[must_use]
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// The subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next delivery. Returns `None` once the session closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Returns an already-delivered message without waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

/// Connection state and error events shared by a session and its driver.
///
/// The first call to [`errors`](Self::errors) receives every error reported
/// since the signals were created, so a listener attached right after
/// `connect` cannot miss failures raised by an eagerly started driver.
#[derive(Debug)]
pub struct SessionSignals {
    state: watch::Sender<SessionState>,
    errors: broadcast::Sender<TransportError>,
    first_errors: Mutex<Option<broadcast::Receiver<TransportError>>>,
}

impl SessionSignals {
    /// Creates signals in the given initial state.
    #[must_use]
    pub fn new(initial: SessionState) -> Self {
        let (state, _) = watch::channel(initial);
        let (errors, first) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            state,
            errors,
            first_errors: Mutex::new(Some(first)),
        }
    }

    /// Transitions to `next`. `Closed` is terminal and never left.
    pub fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Returns the current state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns a receiver tracking state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Reports an error to all error listeners.
    pub fn report(&self, error: TransportError) {
        // No listener attached is not a failure; the error is simply unobserved.
        let _ = self.errors.send(error);
    }

    /// Returns a receiver of error events.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.first_errors
            .lock()
            .take()
            .unwrap_or_else(|| self.errors.subscribe())
    }
}

/// Waits until `state` reports `Connected`.
///
/// # Errors
///
/// Returns `TransportError::Closed` if the session closes first.
pub async fn wait_connected(
    mut state: watch::Receiver<SessionState>,
) -> Result<(), TransportError> {
    let reached = state
        .wait_for(|s| matches!(s, SessionState::Connected | SessionState::Closed))
        .await
        .map_err(|_| TransportError::Closed)?;
    if *reached == SessionState::Connected {
        Ok(())
    } else {
        Err(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_state_transitions_and_closed_is_terminal() {
        let signals = SessionSignals::new(SessionState::Connecting);
        signals.set_state(SessionState::Connected);
        assert_eq!(signals.current_state(), SessionState::Connected);

        signals.set_state(SessionState::Closed);
        signals.set_state(SessionState::Connected);
        assert_eq!(signals.current_state(), SessionState::Closed);
    }

    #[test]
    fn first_error_listener_sees_earlier_errors() {
        let signals = SessionSignals::new(SessionState::Connecting);
        signals.report(TransportError::Io("refused".to_string()));

        let mut first = signals.errors();
        assert_eq!(
            first.try_recv().unwrap(),
            TransportError::Io("refused".to_string())
        );

        // Later listeners only see errors reported after they attached.
        let mut second = signals.errors();
        assert!(second.try_recv().is_err());
        signals.report(TransportError::Closed);
        assert_eq!(second.try_recv().unwrap(), TransportError::Closed);
        assert_eq!(first.try_recv().unwrap(), TransportError::Closed);
    }

    #[tokio::test]
    async fn wait_connected_resolves_on_connect() {
        let signals = SessionSignals::new(SessionState::Connecting);
        let state = signals.state();
        let waiter = tokio::spawn(wait_connected(state));
        signals.set_state(SessionState::Connected);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn wait_connected_fails_on_close() {
        let signals = SessionSignals::new(SessionState::Reconnecting);
        let state = signals.state();
        signals.set_state(SessionState::Closed);
        assert_eq!(wait_connected(state).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn subscription_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new("a_ack", rx);
        tx.send(Delivery {
            channel: "a_ack".to_string(),
            payload: Value::Null,
        })
        .unwrap();
        drop(tx);

        assert_eq!(sub.channel(), "a_ack");
        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
    }
}
