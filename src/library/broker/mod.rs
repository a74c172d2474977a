//! Abstractions over a topic-exchange message broker
//!
//! The subscriber never talks to a broker directly. Instead, it relies on the traits in this
//! module which model the small subset of broker functionality that is required to consume
//! messages:
//!
//! 1. A [`Connection`] to the broker which can be closed to release everything associated with it
//! 2. [`Channels`](Channel) opened on said connection, each with their own prefetch limit
//! 3. Topic exchanges, queues and bindings which are declared through a channel
//! 4. A stream of [`RawDeliveries`](RawDelivery) obtained by consuming a queue
//!
//! Each delivery carries a delivery tag which is a monotonically increasing integer scoped to
//! the channel it has been received on. Acknowledging a delivery with `multiple` set resolves
//! it along with all earlier, unresolved deliveries on the same channel.
//!
//! Implementations are expected to tolerate concurrent calls to [`RawDelivery::acknowledge`] and
//! [`RawDelivery::reject`] for different deliveries of one channel, as workers resolve them in parallel.

use super::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub mod implementation;

/// Options passed to the broker when consuming a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    /// Whether the consumer resolves deliveries explicitly.
    /// When `false`, the broker considers every delivery acknowledged as soon as it has been sent.
    pub manual_ack: bool,
}

/// Metadata accompanying the payload of a delivery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryProperties {
    /// Exchange the message has been published to
    pub exchange: String,
    /// Routing key the message has been published with
    pub routing_key: String,
    /// MIME type of the payload, if provided by the publisher
    pub content_type: Option<String>,
    /// Application provided message identifier
    pub message_id: Option<String>,
    /// Arbitrary string headers
    pub headers: HashMap<String, String>,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
}

/// Message received from a queue, as provided by the broker client
#[async_trait]
pub trait RawDelivery: Send + Sync {
    /// Channel scoped, monotonically increasing identifier
    fn delivery_tag(&self) -> u64;

    /// Opaque message body
    fn payload(&self) -> &[u8];

    /// Metadata of the message
    fn properties(&self) -> &DeliveryProperties;

    /// Confirms the processing of this delivery (and all prior ones on the channel if `multiple` is set)
    async fn acknowledge(&self, multiple: bool) -> EmptyResult;

    /// Returns the delivery to the broker, which requeues or drops it according to its own policy
    async fn reject(&self) -> EmptyResult;
}

/// Stream of deliveries produced by consuming a queue
pub type DeliveryStream<D> = BoxStream<'static, Result<D, BoxedError>>;

/// Broker channel used to declare the topology and consume queues
#[async_trait]
pub trait Channel: Send + Sync {
    /// Type of [`RawDelivery`] yielded when consuming
    type Delivery: RawDelivery + 'static;

    /// Declares a topic exchange, succeeding if it already exists
    async fn declare_topic_exchange(&self, name: &str) -> EmptyResult;

    /// Declares a queue, succeeding if it already exists
    async fn declare_queue(&self, name: &str, durable: bool) -> EmptyResult;

    /// Binds a queue to an exchange using a routing key pattern
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> EmptyResult;

    /// Starts consuming a queue. The stream ends once the channel or its connection is closed.
    async fn consume(
        &self,
        queue: &str,
        options: SubscriptionOptions,
    ) -> Result<DeliveryStream<Self::Delivery>, BoxedError>;
}

/// Connection to a broker which owns any number of channels
#[async_trait]
pub trait Connection: Send + Sync {
    /// Type of [`Channel`] provided by the connection
    type Channel: Channel + 'static;

    /// Opens a new channel on which at most `prefetch` deliveries may be unacknowledged at once.
    /// A value of zero disables the limit.
    async fn create_channel(&self, prefetch: u16) -> Result<Self::Channel, BoxedError>;

    /// Closes the connection, all of its channels and releases any unacknowledged deliveries
    async fn close(&self) -> EmptyResult;
}

/// Settings required to establish a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Hostname of the broker
    pub host: String,
    /// Port of the broker
    pub port: u16,
    /// User to authenticate as
    pub username: String,
    /// Password of the user
    pub password: String,
    /// Virtual host to connect to
    pub virtual_host: String,
    /// Interval of heartbeats exchanged with the broker
    pub heartbeat: Duration,
    /// Time to wait for the connection to be established
    pub timeout: Duration,
}

/// Entry point of a broker client which establishes [`Connections`](Connection)
#[async_trait]
pub trait Connector: Send + Sync {
    /// Type of [`Connection`] being established
    type Connection: Connection;

    /// Opens a new connection. Enforcing the timeout is up to the caller.
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Self::Connection, BoxedError>;
}
