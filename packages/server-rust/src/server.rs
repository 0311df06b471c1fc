//! RPC server lifecycle.
//!
//! Follows a deferred startup pattern:
//! 1. `new()` -- allocates the handler registry; nothing touches the broker
//! 2. `add_handler()` -- registers operations
//! 3. `listen()` -- opens the session pair, binds subscriptions, waits for the
//!    consumer to connect, then signals readiness
//! 4. `close()` -- stops intake and releases both sessions
//!
//! A closed server may `listen` again with a fresh session pair. Handlers
//! registered while listening are picked up by the next `listen`.

use std::sync::Arc;

use ackbus_core::channel::ChannelError;
use tokio::task::JoinHandle;
use tracing::info;

use crate::network::{attach_error_hook, SessionPair, SessionRole};
use crate::service::{
    Dispatcher, HandlerRegistry, MessageHandler, ServerConfig, SubscriptionBinder,
};
use crate::traits::{ErrorSink, TracingErrorSink, Transport};
use crate::transport::{wait_connected, TransportError};

/// Errors returned by [`RpcServer`] setup calls.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already listening")]
    AlreadyListening,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid message pattern: {0}")]
    InvalidPattern(#[from] ChannelError),
}

/// RPC-over-pub/sub server.
///
/// Requests arrive on `<op>_ack` through the consumer session; responses
/// leave on `<op>_<id>_res` through the publisher session.
pub struct RpcServer {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    sink: Arc<dyn ErrorSink>,
    sessions: Option<SessionPair>,
    bindings: Vec<JoinHandle<()>>,
    hooks: Vec<JoinHandle<()>>,
}

impl RpcServer {
    /// Creates a server without connecting. Errors go to `tracing` until
    /// [`with_error_sink`](Self::with_error_sink) replaces the sink.
    #[must_use]
    pub fn new(config: ServerConfig, transport: impl Transport + 'static) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            registry: Arc::new(HandlerRegistry::new()),
            sink: Arc::new(TracingErrorSink),
            sessions: None,
            bindings: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Replaces the error sink used by dispatch and the error hooks.
    #[must_use]
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns a shared reference to the handler registry.
    #[must_use]
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Registers `handler` for `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::InvalidPattern` if `pattern` cannot be used as an
    /// operation name.
    pub fn add_handler<H: MessageHandler>(
        &self,
        pattern: impl Into<String>,
        handler: H,
    ) -> Result<(), ServerError> {
        self.registry.register(pattern, handler)?;
        Ok(())
    }

    /// Whether a session pair is currently open.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.sessions.is_some()
    }

    /// Opens the consumer and publisher sessions, subscribes to the ack
    /// channel of every registered operation and calls `on_ready` once the
    /// consumer is connected.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::AlreadyListening` if called twice without
    /// `close`, or a transport error if a session cannot be opened, a
    /// subscription fails, or the consumer closes before connecting. On error
    /// no sessions are left open and `on_ready` is not called.
    pub async fn listen<F: FnOnce()>(&mut self, on_ready: F) -> Result<(), ServerError> {
        if self.sessions.is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let options = self.config.connect_options();
        let pair = SessionPair::connect(self.transport.as_ref(), &options)?;
        self.hooks = [SessionRole::Consumer, SessionRole::Publisher]
            .into_iter()
            .map(|role| attach_error_hook(pair.get(role).as_ref(), role, Arc::clone(&self.sink)))
            .collect();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.sink),
        ));
        let binder = SubscriptionBinder::new(Arc::clone(&self.registry), dispatcher);
        let connected = pair.consumer.state();
        let bound = binder.bind(pair.consumer.as_ref(), &pair.publisher);

        // Stored before waiting so a cancelled listen can still be closed.
        self.sessions = Some(pair);
        match bound {
            Ok(bindings) => self.bindings = bindings,
            Err(e) => {
                self.close();
                return Err(e.into());
            }
        }

        if let Err(e) = wait_connected(connected).await {
            self.close();
            return Err(e.into());
        }

        info!(
            url = %options.url,
            patterns = self.registry.len(),
            "rpc server listening"
        );
        on_ready();
        Ok(())
    }

    /// Stops intake and closes both sessions. Idempotent.
    ///
    /// Dispatches already running are not cancelled; their publishes hit a
    /// closed session and surface as errors.
    pub fn close(&mut self) {
        for binding in self.bindings.drain(..) {
            binding.abort();
        }
        if let Some(pair) = self.sessions.take() {
            pair.close();
            info!("rpc server closed");
        }
        // Hooks end on their own once every holder releases the sessions.
        self.hooks.clear();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.close();
    }
}
