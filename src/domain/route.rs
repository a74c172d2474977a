use super::{FilterChain, Handler};
use crate::library::broker::SubscriptionOptions;
use crate::library::pool::WorkerPool;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

/// Contract governing how and when deliveries are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcknowledgementMode {
    /// Deliveries are acknowledged by the broker as soon as they are sent
    None,
    /// The handler resolves deliveries on its own
    Manual,
    /// Deliveries are acknowledged after the action succeeded or a redelivery has been scheduled
    AtLeastOnce,
    /// Deliveries are acknowledged before the action runs
    AtMostOnceSingle,
    /// Every delivery whose tag is a multiple of the contained value is acknowledged together
    /// with all prior ones before the action runs. Other deliveries are not resolved individually.
    ///
    /// Under concurrent processing the multiple-acknowledgement may cover deliveries whose
    /// action has not yet started or finished.
    AtMostOnceBatched(NonZeroU64),
}

impl AcknowledgementMode {
    /// At-most-once delivery acknowledging every `every` messages. Values of one or less
    /// acknowledge each message individually.
    pub fn at_most_once(every: u64) -> Self {
        match NonZeroU64::new(every) {
            Some(every) if every.get() > 1 => Self::AtMostOnceBatched(every),
            _ => Self::AtMostOnceSingle,
        }
    }

    /// Whether the broker has to wait for explicit resolutions
    pub fn acknowledge_messages(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl Default for AcknowledgementMode {
    fn default() -> Self {
        Self::None
    }
}

/// Binding of a single action to the broker resources it consumes from
///
/// Routes are assembled by a [`SubscriberBuilder`](super::SubscriberBuilder) and immutable afterwards.
#[derive(Clone)]
pub struct Route {
    pub(super) action: String,
    pub(super) handler: Arc<dyn Handler>,
    pub(super) exchange: String,
    pub(super) queue: String,
    pub(super) routing_key: String,
    pub(super) durable: bool,
    pub(super) prefetch: u16,
    pub(super) acknowledgement_mode: AcknowledgementMode,
    pub(super) around_filters: FilterChain,
    pub(super) middleware: FilterChain,
    pub(super) worker_pool: WorkerPool,
}

impl Route {
    /// Name of the action
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Handler executing the action
    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }

    /// Topic exchange the queue is bound to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Queue consumed by the route
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Routing key pattern used to bind the queue
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the queue survives broker restarts
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Maximum number of unacknowledged deliveries on the route's channel
    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Contract used to resolve deliveries
    pub fn acknowledgement_mode(&self) -> AcknowledgementMode {
        self.acknowledgement_mode
    }

    /// See [`AcknowledgementMode::acknowledge_messages`]
    pub fn acknowledge_messages(&self) -> bool {
        self.acknowledgement_mode.acknowledge_messages()
    }

    /// Options to request when consuming the route's queue
    pub fn queue_subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            manual_ack: self.acknowledge_messages(),
        }
    }

    /// Filters wrapping the handler
    pub fn around_filters(&self) -> &FilterChain {
        &self.around_filters
    }

    /// Middleware wrapping the acknowledgement procedure
    pub fn middleware(&self) -> &FilterChain {
        &self.middleware
    }

    /// Pool the route's deliveries are processed on
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("action", &self.action)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("durable", &self.durable)
            .field("prefetch", &self.prefetch)
            .field("acknowledgement_mode", &self.acknowledgement_mode)
            .field("around_filters", &self.around_filters)
            .field("middleware", &self.middleware)
            .field("worker_pool", &self.worker_pool.name())
            .finish()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn collapse_small_batches() {
        assert_eq!(
            AcknowledgementMode::at_most_once(0),
            AcknowledgementMode::AtMostOnceSingle
        );
        assert_eq!(
            AcknowledgementMode::at_most_once(1),
            AcknowledgementMode::AtMostOnceSingle
        );
        assert_eq!(
            AcknowledgementMode::at_most_once(10),
            AcknowledgementMode::AtMostOnceBatched(NonZeroU64::new(10).unwrap())
        );
    }

    #[test]
    fn require_acknowledgements_unless_disabled() {
        assert!(!AcknowledgementMode::None.acknowledge_messages());
        assert!(AcknowledgementMode::Manual.acknowledge_messages());
        assert!(AcknowledgementMode::AtLeastOnce.acknowledge_messages());
        assert!(AcknowledgementMode::at_most_once(1).acknowledge_messages());
        assert!(AcknowledgementMode::at_most_once(5).acknowledge_messages());
    }
}
