//! Broker living entirely within the current process
//!
//! This implementation mimics the parts of an AMQP 0-9-1 broker that are relevant for
//! consumers: topic exchanges with wildcard bindings, durable and transient queues, channels
//! with their own delivery tag sequence and prefetch limit, acknowledgements (single and multiple),
//! rejections with requeueing and connection shutdown which releases everything that is
//! still unacknowledged.
//!
//! It is primarily used for testing and local development, where running a real broker is
//! either not possible or not worth the hassle.
//!
//! ```ignore
//! let broker = MemoryBroker::default();
//! let connection = broker.connect();
//!
//! // ... start a subscription set using the connection, then
//! broker.publish("events", "accounts.users.created", br#"{"id":42}"#.to_vec())?;
//! ```

mod broker;
mod channel;
mod topic;

pub use broker::*;
pub use channel::*;
pub use topic::topic_matches;

use thiserror::Error;

/// Failures reported by the in-memory broker
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemoryBrokerError {
    /// Exchange has not been declared
    #[error("exchange '{0}' has not been declared")]
    ExchangeNotFound(String),
    /// Queue has not been declared
    #[error("queue '{0}' has not been declared")]
    QueueNotFound(String),
    /// Delivery tag is not outstanding on the channel
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    /// Operation on a channel which has been closed
    #[error("channel has been closed")]
    ChannelClosed,
    /// Operation on a connection which has been closed
    #[error("connection has been closed")]
    ConnectionClosed,
}
