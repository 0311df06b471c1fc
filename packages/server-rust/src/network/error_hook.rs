//! Forwards session error events to the error sink.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use super::session::SessionRole;
use crate::traits::{ErrorSink, Session};

/// Spawns a task that reports every transport error of `session` to `sink`,
/// tagged with the session's role. The task ends once the session's error
/// channel closes; abort the handle to detach earlier.
///
/// Errors never stop the server. Reconnection stays with the transport.
pub fn attach_error_hook(
    session: &dyn Session,
    role: SessionRole,
    sink: Arc<dyn ErrorSink>,
) -> JoinHandle<()> {
    let mut errors = session.errors();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(err) => sink.error(&format!("{role} session error: {err}")),
                Err(RecvError::Lagged(missed)) => {
                    sink.error(&format!("{role} session dropped {missed} error events"));
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(%role, "error hook detached");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::traits::Transport;
    use crate::transport::{ConnectOptions, Encoding, MemoryBroker, TransportError};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<String>>);

    impl ErrorSink for RecordingSink {
        fn error(&self, message: &str) {
            self.0.lock().push(message.to_string());
        }
    }

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

    async fn wait_for_messages(sink: &RecordingSink, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let messages = sink.0.lock().clone();
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.0.lock().clone()
    }

    #[tokio::test]
    async fn errors_are_logged_with_role() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let sink = Arc::new(RecordingSink::default());
        let hook = attach_error_hook(session.as_ref(), SessionRole::Publisher, sink.clone());

        broker.inject_error(&TransportError::Disconnected("reset by peer".to_string()));

        let messages = wait_for_messages(&sink, 1).await;
        assert_eq!(
            messages,
            vec!["publisher session error: connection lost: reset by peer".to_string()]
        );
        hook.abort();
    }

    #[tokio::test]
    async fn errors_raised_before_attaching_are_not_lost() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        broker.inject_error(&TransportError::Io("refused".to_string()));

        let sink = Arc::new(RecordingSink::default());
        let hook = attach_error_hook(session.as_ref(), SessionRole::Consumer, sink.clone());

        let messages = wait_for_messages(&sink, 1).await;
        assert_eq!(messages, vec!["consumer session error: i/o error: refused".to_string()]);
        hook.abort();
    }

    #[tokio::test]
    async fn hook_survives_repeated_errors() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let sink = Arc::new(RecordingSink::default());
        let hook = attach_error_hook(session.as_ref(), SessionRole::Consumer, sink.clone());

        for _ in 0..3 {
            broker.inject_error(&TransportError::Server("slow consumer".to_string()));
        }

        assert_eq!(wait_for_messages(&sink, 3).await.len(), 3);
        assert!(!hook.is_finished());
        hook.abort();
    }
}
