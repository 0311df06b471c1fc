//! Binds registered patterns to ack-channel subscriptions.

use std::sync::Arc;

use ackbus_core::channel::ack_channel;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::dispatcher::Dispatcher;
use super::registry::HandlerRegistry;
use crate::traits::Session;
use crate::transport::{Subscription, TransportError};

/// Subscribes the consumer session to `<op>_ack` for every registered
/// operation and feeds each delivery to the dispatcher.
pub struct SubscriptionBinder {
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl SubscriptionBinder {
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Subscribes once per registered pattern and spawns one receive loop per
    /// subscription. Every delivery is dispatched on its own task, so a slow
    /// handler never holds up other requests.
    ///
    /// Returns the receive loops; aborting them stops intake.
    ///
    /// # Errors
    ///
    /// Returns the first subscribe failure. Loops spawned before the failure
    /// are aborted.
    pub fn bind(
        &self,
        consumer: &dyn Session,
        publisher: &Arc<dyn Session>,
    ) -> Result<Vec<JoinHandle<()>>, TransportError> {
        let patterns = self.registry.patterns();
        let mut loops: Vec<JoinHandle<()>> = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let channel = ack_channel(&pattern);
            let subscription = match consumer.subscribe(&channel) {
                Ok(subscription) => subscription,
                Err(e) => {
                    for handle in &loops {
                        handle.abort();
                    }
                    return Err(e);
                }
            };
            debug!(channel = %channel, "subscribed");
            loops.push(tokio::spawn(receive_loop(
                subscription,
                Arc::clone(&self.dispatcher),
                Arc::clone(publisher),
            )));
        }

        info!(subscriptions = loops.len(), "bound message patterns");
        Ok(loops)
    }
}

async fn receive_loop(
    mut subscription: Subscription,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<dyn Session>,
) {
    while let Some(delivery) = subscription.next().await {
        let dispatcher = Arc::clone(&dispatcher);
        let publisher = Arc::clone(&publisher);
        tokio::spawn(async move {
            dispatcher.dispatch(delivery, &publisher).await;
        });
    }
    debug!(channel = %subscription.channel(), "subscription ended");
}
