use crate::library::broker::{DeliveryProperties, RawDelivery};
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Single inbound message along with the route it has been received on
///
/// The environment guards the resolution of the underlying delivery. Once it has been
/// acknowledged or rejected successfully, any further attempt to resolve it is refused
/// without contacting the broker and reported as `false`.
pub struct DeliveryEnvironment {
    action: String,
    queue: String,
    received_at: DateTime<Utc>,
    delivery: Box<dyn RawDelivery>,
    resolution: Mutex<()>,
    resolved: AtomicBool,
}

impl DeliveryEnvironment {
    /// Wraps a raw delivery that has been received for the given action on a queue
    pub fn new(action: &str, queue: &str, delivery: Box<dyn RawDelivery>) -> Self {
        Self {
            action: action.to_owned(),
            queue: queue.to_owned(),
            received_at: Utc::now(),
            delivery,
            resolution: Mutex::new(()),
            resolved: AtomicBool::new(false),
        }
    }

    /// Name of the action handling this delivery
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Queue the delivery has been consumed from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Exchange the message has been published to
    pub fn exchange(&self) -> &str {
        &self.delivery.properties().exchange
    }

    /// Routing key the message has been published with
    pub fn routing_key(&self) -> &str {
        &self.delivery.properties().routing_key
    }

    /// Channel scoped, monotonically increasing identifier of the delivery
    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag()
    }

    /// Raw message body
    pub fn payload(&self) -> &[u8] {
        self.delivery.payload()
    }

    /// Metadata of the message
    pub fn properties(&self) -> &DeliveryProperties {
        self.delivery.properties()
    }

    /// Headers attached to the message
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.delivery.properties().headers
    }

    /// Point in time at which the delivery has been received
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Decodes the payload as JSON
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.payload())
    }

    /// Whether the delivery has been resolved, either through the broker or virtually
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Acknowledges the delivery (and all prior ones on the channel if `multiple` is set)
    ///
    /// Returns whether the broker confirmed the acknowledgement. Failures are logged.
    pub async fn acknowledge(&self, multiple: bool) -> bool {
        let _resolution = self.resolution.lock().await;

        if self.is_resolved() {
            warn!(tag = self.delivery_tag(), "Refusing to acknowledge resolved delivery");
            return false;
        }

        match self.delivery.acknowledge(multiple).await {
            Ok(_) => {
                debug!(tag = self.delivery_tag(), multiple, "Acknowledged delivery");
                self.resolved.store(true, Ordering::SeqCst);
                true
            }
            Err(error) => {
                warn!(tag = self.delivery_tag(), %error, "Failed to acknowledge delivery");
                false
            }
        }
    }

    /// Rejects the delivery, returning it to the broker
    ///
    /// Returns whether the broker confirmed the rejection. Failures are logged.
    pub async fn reject(&self) -> bool {
        let _resolution = self.resolution.lock().await;

        if self.is_resolved() {
            warn!(tag = self.delivery_tag(), "Refusing to reject resolved delivery");
            return false;
        }

        match self.delivery.reject().await {
            Ok(_) => {
                debug!(tag = self.delivery_tag(), "Rejected delivery");
                self.resolved.store(true, Ordering::SeqCst);
                true
            }
            Err(error) => {
                warn!(tag = self.delivery_tag(), %error, "Failed to reject delivery");
                false
            }
        }
    }

    /// Marks the delivery as resolved without contacting the broker.
    /// Used when a later multiple-acknowledgement covers it.
    pub(crate) fn mark_resolved(&self) {
        self.resolved.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for DeliveryEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEnvironment")
            .field("action", &self.action)
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag())
            .field("received_at", &self.received_at)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
