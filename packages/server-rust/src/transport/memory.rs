//! In-process broker with exact-match channel routing.
//!
//! Every session connected to the same [`MemoryBroker`] shares its routing
//! table. The broker itself can publish and subscribe, which lets tests act
//! as the remote caller, and it can simulate outages and transport errors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use super::{ConnectOptions, Delivery, SessionSignals, SessionState, Subscription, TransportError};
use crate::traits::{Session, Transport};

/// Identifies one subscriber inside the routing table.
type SubscriberId = u64;

#[derive(Debug, Default)]
struct BrokerInner {
    /// channel -> live subscribers.
    routes: DashMap<String, Vec<(SubscriberId, mpsc::UnboundedSender<Delivery>)>>,
    /// Sessions that have not been closed.
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    next_subscriber: AtomicU64,
    /// When false, new sessions start in `Connecting` until `set_online(true)`.
    manual_connect: bool,
    online: AtomicBool,
}

impl BrokerInner {
    fn subscribe(&self, channel: &str) -> (SubscriberId, Subscription) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));
        (id, Subscription::new(channel, rx))
    }

    fn unsubscribe(&self, channel: &str, id: SubscriberId) {
        if let Some(mut subs) = self.routes.get_mut(channel) {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        self.routes.remove_if(channel, |_, subs| subs.is_empty());
    }

    /// Routes `payload` to every live subscriber of `channel`, returning how
    /// many received it.
    fn route(&self, channel: &str, payload: &Value) -> usize {
        let Some(mut subs) = self.routes.get_mut(channel) else {
            return 0;
        };
        subs.retain(|(_, tx)| {
            tx.send(Delivery {
                channel: channel.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
        });
        subs.len()
    }
}

/// Process-local pub/sub broker.
///
/// Cloning shares the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Creates a broker whose sessions connect immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                online: AtomicBool::new(true),
                ..BrokerInner::default()
            }),
        }
    }

    /// Creates an offline broker: sessions stay `Connecting` until
    /// [`set_online`](Self::set_online) is called.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                manual_connect: true,
                online: AtomicBool::new(false),
                ..BrokerInner::default()
            }),
        }
    }

    /// Publishes as an external client would.
    ///
    /// Returns the number of subscribers that received the message.
    pub fn publish(&self, channel: &str, payload: Value) -> usize {
        self.inner.route(channel, &payload)
    }

    /// Subscribes as an external client would.
    #[must_use]
    pub fn subscribe(&self, channel: &str) -> Subscription {
        self.inner.subscribe(channel).1
    }

    /// Number of live subscribers on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .routes
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }

    /// Number of sessions that have not been closed.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Brings the broker up or down. Open sessions move to `Connected` or
    /// `Reconnecting` accordingly.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        let next = if online {
            SessionState::Connected
        } else {
            SessionState::Reconnecting
        };
        for session in self.inner.sessions.lock().iter() {
            session.signals.set_state(next);
        }
    }

    /// Reports `error` on every open session.
    pub fn inject_error(&self, error: &TransportError) {
        for session in self.inner.sessions.lock().iter() {
            session.signals.report(error.clone());
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryBroker {
    fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Session>, TransportError> {
        let online = self.inner.online.load(Ordering::SeqCst);
        let initial = match (online, self.inner.manual_connect) {
            (true, _) => SessionState::Connected,
            (false, true) => SessionState::Connecting,
            (false, false) => SessionState::Reconnecting,
        };
        debug!(url = %options.url, ?initial, "memory session opened");

        let session = Arc::new(MemorySession {
            broker: Arc::clone(&self.inner),
            signals: SessionSignals::new(initial),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.inner.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Session attached to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySession {
    broker: Arc<BrokerInner>,
    signals: SessionSignals,
    subscriptions: Mutex<Vec<(String, SubscriberId)>>,
    closed: AtomicBool,
}

impl Session for MemorySession {
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (id, subscription) = self.broker.subscribe(channel);
        self.subscriptions.lock().push((channel.to_string(), id));
        Ok(subscription)
    }

    fn publish(&self, channel: &str, message: Value) {
        if self.closed.load(Ordering::SeqCst) {
            self.signals.report(TransportError::Closed);
            return;
        }
        self.broker.route(channel, &message);
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.signals.state()
    }

    fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.signals.errors()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (channel, id) in self.subscriptions.lock().drain(..) {
            self.broker.unsubscribe(&channel, id);
        }
        self.broker
            .sessions
            .lock()
            .retain(|s| !std::ptr::eq(Arc::as_ptr(s), self));
        self.signals.set_state(SessionState::Closed);
    }
}
