use std::future::Future;
use std::sync::Arc;

use ackbus_core::channel::{validate_operation_name, ChannelError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::operation::{HandlerError, HandlerOutput};

// ---------------------------------------------------------------------------
// MessageHandler trait
// ---------------------------------------------------------------------------

/// Request handler for one operation.
///
/// Receives the request's `data` and answers with any [`HandlerOutput`]
/// shape. Returning an error produces an in-band error response.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, data: Value) -> Result<HandlerOutput, HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

/// Wraps `f` as a handler. The closure may return any type convertible into
/// [`HandlerOutput`].
pub fn handler_fn<F, Fut, O>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    O: Into<HandlerOutput> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut, O> MessageHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    O: Into<HandlerOutput> + Send,
{
    async fn handle(&self, data: Value) -> Result<HandlerOutput, HandlerError> {
        (self.0)(data).await.map(Into::into)
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Registry mapping operation names (patterns) to handlers.
///
/// The dispatcher only reads it. Subscriptions are derived from the patterns
/// present when the server starts listening.
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register `handler` for `pattern`, replacing any previous handler.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid operation name.
    pub fn register<H: MessageHandler>(
        &self,
        pattern: impl Into<String>,
        handler: H,
    ) -> Result<(), ChannelError> {
        let pattern = pattern.into();
        validate_operation_name(&pattern)?;
        if self.handlers.insert(pattern.clone(), Arc::new(handler)).is_some() {
            debug!(pattern = %pattern, "replaced message handler");
        }
        Ok(())
    }

    /// Retrieve the handler for `pattern`.
    pub fn get(&self, pattern: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(pattern).map(|entry| entry.value().clone())
    }

    /// Whether a handler is registered for `pattern`.
    #[must_use]
    pub fn contains(&self, pattern: &str) -> bool {
        self.handlers.contains_key(pattern)
    }

    /// All registered patterns, sorted.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        patterns.sort_unstable();
        patterns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
