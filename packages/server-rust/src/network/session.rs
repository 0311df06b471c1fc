//! Consumer/publisher session pair.
//!
//! The server keeps two independent broker sessions: one only subscribes
//! (the consumer) and one only publishes (the publisher). Each reconnects on
//! its own; neither waits on the other.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::traits::{Session, Transport};
use crate::transport::{ConnectOptions, TransportError};

/// Which half of the pair a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Receives requests on `<op>_ack`.
    Consumer,
    /// Publishes responses on `<op>_<id>_res`.
    Publisher,
}

impl SessionRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Publisher => "publisher",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two sessions opened with the same options.
#[derive(Debug, Clone)]
pub struct SessionPair {
    pub consumer: Arc<dyn Session>,
    pub publisher: Arc<dyn Session>,
}

impl SessionPair {
    /// Opens the consumer, then the publisher. A configured client name gets
    /// the role appended (`billing-consumer`, `billing-publisher`).
    ///
    /// # Errors
    ///
    /// Returns the transport's error if either session cannot be created.
    /// A consumer opened before a publisher failure is closed again.
    pub fn connect(
        transport: &dyn Transport,
        options: &ConnectOptions,
    ) -> Result<Self, TransportError> {
        let consumer = transport.connect(&with_role(options, SessionRole::Consumer))?;
        let publisher = match transport.connect(&with_role(options, SessionRole::Publisher)) {
            Ok(publisher) => publisher,
            Err(e) => {
                consumer.close();
                return Err(e);
            }
        };
        info!(url = %options.url, "opened consumer and publisher sessions");
        Ok(Self {
            consumer,
            publisher,
        })
    }

    /// Returns the session for `role`.
    #[must_use]
    pub fn get(&self, role: SessionRole) -> &Arc<dyn Session> {
        match role {
            SessionRole::Consumer => &self.consumer,
            SessionRole::Publisher => &self.publisher,
        }
    }

    /// Closes both sessions. Idempotent.
    pub fn close(&self) {
        self.consumer.close();
        self.publisher.close();
    }
}

fn with_role(options: &ConnectOptions, role: SessionRole) -> ConnectOptions {
    ConnectOptions {
        name: options.name.as_ref().map(|name| format!("{name}-{role}")),
        ..options.clone()
    }
}
