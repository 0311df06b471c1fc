//! Per-request dispatch: resolve, invoke, publish.
//!
//! Each delivery is handled independently:
//!
//! 1. **Resolve** the operation by stripping `_ack` from the delivery channel.
//! 2. **Decode** the body as `{ id, data }`.
//! 3. **Look up** the handler. Missing handlers get an in-band
//!    "no equivalent message pattern" error response.
//! 4. **Invoke** the handler with `data` and drain its normalized result
//!    stream, publishing every item on `<op>_<id>_res`.
//!
//! Handler errors, stream errors and panics become `status: "error"`
//! responses on the same channel. Deliveries that cannot be answered (no
//! id, not an ack channel) go to the error sink and are dropped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use ackbus_core::channel::operation_from_ack_channel;
use ackbus_core::messages::{ErrorResponse, RequestPacket};
use futures_util::{FutureExt, StreamExt};
use tracing::{debug, info_span, Instrument};

use super::operation::HandlerError;
use super::publisher::{make_publisher, ResponsePublisher};
use super::registry::HandlerRegistry;
use crate::traits::{ErrorSink, Session};
use crate::transport::Delivery;

/// How one dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran to completion; `published` responses were sent.
    Completed { published: usize },
    /// No handler for the operation; an error response was sent.
    NoHandler,
    /// The handler or its stream failed after `published` responses; an
    /// error response was sent.
    Failed { published: usize },
    /// The delivery could not be answered and was dropped.
    Rejected,
}

impl DispatchOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::NoHandler => "no_handler",
            Self::Failed { .. } => "failed",
            Self::Rejected => "rejected",
        }
    }
}

/// Stateless request dispatcher shared by every subscription.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    errors: Arc<dyn ErrorSink>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, errors: Arc<dyn ErrorSink>) -> Self {
        Self { registry, errors }
    }

    /// Handles one delivery, publishing through `publisher`.
    pub async fn dispatch(&self, delivery: Delivery, publisher: &Arc<dyn Session>) -> DispatchOutcome {
        let operation = match operation_from_ack_channel(&delivery.channel) {
            Ok(op) => op.to_string(),
            Err(e) => {
                self.errors.error(&format!("dropping delivery: {e}"));
                return DispatchOutcome::Rejected;
            }
        };
        let request: RequestPacket = match serde_json::from_value(delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                self.errors.error(&format!(
                    "dropping malformed request on {:?}: {e}",
                    delivery.channel
                ));
                return DispatchOutcome::Rejected;
            }
        };

        let span = info_span!(
            "dispatch",
            operation = %operation,
            request_id = %request.id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let publish = make_publisher(Arc::clone(publisher), &operation, &request.id);
            let outcome = self.invoke(&operation, request, &publish).await;

            let span = tracing::Span::current();
            #[allow(clippy::cast_possible_truncation)]
            span.record("duration_ms", start.elapsed().as_millis() as u64);
            span.record("outcome", outcome.label());
            debug!(?outcome, "dispatch finished");
            outcome
        }
        .instrument(span)
        .await
    }

    async fn invoke(
        &self,
        operation: &str,
        request: RequestPacket,
        publish: &ResponsePublisher,
    ) -> DispatchOutcome {
        let Some(handler) = self.registry.get(operation) else {
            publish.publish(ErrorResponse::no_pattern(request.id).into_value());
            return DispatchOutcome::NoHandler;
        };

        let mut published = 0;
        let run = async {
            let mut responses = handler.handle(request.data).await?.into_stream();
            while let Some(item) = responses.next().await {
                publish.publish(item?);
                published += 1;
            }
            Ok::<(), HandlerError>(())
        };

        let result = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let err = HandlerError::Panicked(panic_message(panic.as_ref()));
                self.errors
                    .error(&format!("handler for {operation:?} panicked: {err}"));
                Err(err)
            }
        };

        match result {
            Ok(()) => DispatchOutcome::Completed { published },
            Err(err) => {
                publish.publish_error(err.to_string());
                DispatchOutcome::Failed { published }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
