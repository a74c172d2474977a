use super::{DeliveryEnvironment, MessageRetry};
use crate::library::backoff::Backoff;
use crate::library::broker::implementation::memory::{MemoryBroker, MemoryMessage};
use crate::library::EmptyResult;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Header carrying the number of redeliveries a message went through
pub const ATTEMPTS_HEADER: &str = "x-redelivery-attempts";

/// Redelivers failed messages to their queue on a [`MemoryBroker`] after an exponential delay
///
/// Once the backoff is exhausted, messages are dropped.
#[derive(Debug, Clone)]
pub struct MemoryRetry {
    broker: MemoryBroker,
    backoff: Backoff,
}

impl MemoryRetry {
    /// Creates a retry collaborator using the default backoff
    pub fn new(broker: MemoryBroker) -> Self {
        Self::with_backoff(broker, Backoff::default())
    }

    /// Creates a retry collaborator with a custom backoff
    pub fn with_backoff(broker: MemoryBroker, backoff: Backoff) -> Self {
        Self { broker, backoff }
    }
}

#[async_trait]
impl MessageRetry for MemoryRetry {
    async fn redeliver_with_backoff(&self, environment: &DeliveryEnvironment) -> EmptyResult {
        let attempt = environment
            .headers()
            .get(ATTEMPTS_HEADER)
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;

        let delay = match self.backoff.delay_for_attempt(attempt) {
            Some(delay) => delay,
            None => {
                warn!(
                    queue = environment.queue(),
                    attempt, "Dropping message after exhausting all redelivery attempts"
                );
                return Ok(());
            }
        };

        let mut properties = environment.properties().clone();
        properties.redelivered = false;
        properties
            .headers
            .insert(ATTEMPTS_HEADER.to_owned(), attempt.to_string());

        let message = MemoryMessage {
            payload: environment.payload().to_vec(),
            properties,
        };

        let broker = self.broker.clone();
        let queue = environment.queue().to_owned();

        debug!(queue = %queue, attempt, ?delay, "Scheduling redelivery");

        tokio::spawn(async move {
            sleep(delay).await;

            if let Err(error) = broker.enqueue(&queue, message) {
                warn!(%queue, %error, "Failed to redeliver message");
            }
        });

        Ok(())
    }
}
