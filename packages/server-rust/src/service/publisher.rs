//! Response publishing bound to one call.

use std::sync::Arc;

use ackbus_core::channel::response_channel;
use ackbus_core::messages::{stamp_id, ErrorResponse};
use serde_json::Value;
use tracing::trace;

use crate::traits::Session;

/// Publishes responses for a single request on its response channel.
///
/// Every payload gets the request id stamped onto it. Publishing never waits
/// for the broker; failures show up on the session's error events.
#[derive(Debug, Clone)]
pub struct ResponsePublisher {
    session: Arc<dyn Session>,
    channel: String,
    request_id: String,
}

/// Binds `session`, `operation` and `request_id` into a publisher for
/// `response_channel(operation, request_id)`.
#[must_use]
pub fn make_publisher(
    session: Arc<dyn Session>,
    operation: &str,
    request_id: &str,
) -> ResponsePublisher {
    ResponsePublisher {
        session,
        channel: response_channel(operation, request_id),
        request_id: request_id.to_string(),
    }
}

impl ResponsePublisher {
    /// Channel this publisher writes to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publishes `payload` with `id` set to the request id.
    pub fn publish(&self, payload: Value) {
        trace!(channel = %self.channel, "publishing response");
        self.session
            .publish(&self.channel, stamp_id(payload, &self.request_id));
    }

    /// Publishes `{ id, status: "error", err }`.
    pub fn publish_error(&self, err: impl Into<String>) {
        self.publish(ErrorResponse::new(self.request_id.as_str(), err).into_value());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::traits::Transport;
    use crate::transport::{ConnectOptions, Encoding, MemoryBroker};

    fn session(broker: &MemoryBroker) -> Arc<dyn Session> {
        broker
            .connect(&ConnectOptions {
                url: "memory://".to_string(),
                encoding: Encoding::Json,
                max_reconnect_attempts: 0,
                reconnect_delay: Duration::from_millis(1),
                name: None,
            })
            .unwrap()
    }

    #[test]
    fn publishes_on_response_channel_with_id() {
        let broker = MemoryBroker::new();
        let mut tap = broker.subscribe("greet_42_res");
        let publisher = make_publisher(session(&broker), "greet", "42");

        assert_eq!(publisher.channel(), "greet_42_res");
        publisher.publish(json!({ "greeting": "hello" }));

        let delivery = tap.try_next().unwrap();
        assert_eq!(delivery.payload, json!({ "greeting": "hello", "id": "42" }));
        assert!(tap.try_next().is_none());
    }

    #[test]
    fn payload_id_is_overwritten() {
        let broker = MemoryBroker::new();
        let mut tap = broker.subscribe("greet_7_res");
        make_publisher(session(&broker), "greet", "7").publish(json!({ "id": "other" }));

        assert_eq!(tap.try_next().unwrap().payload, json!({ "id": "7" }));
    }

    #[test]
    fn publish_error_uses_error_shape() {
        let broker = MemoryBroker::new();
        let mut tap = broker.subscribe("sum_1_res");
        make_publisher(session(&broker), "sum", "1").publish_error("bad input");

        assert_eq!(
            tap.try_next().unwrap().payload,
            json!({ "id": "1", "status": "error", "err": "bad input" })
        );
    }

    #[test]
    fn publish_on_closed_session_reports_error() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let mut errors = session.errors();
        session.close();

        make_publisher(session, "greet", "1").publish(json!({}));
        assert!(errors.try_recv().is_ok());
    }
}
