use super::{topic_matches, MemoryBrokerError, MemoryConnection};
use crate::library::broker::{ConnectionSettings, Connector, DeliveryProperties};
use crate::library::BoxedError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

/// Message stored in a queue of the [`MemoryBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMessage {
    /// Opaque message body
    pub payload: Vec<u8>,
    /// Metadata of the message
    pub properties: DeliveryProperties,
}

impl MemoryMessage {
    /// Creates a new message with a random message id
    pub fn new(payload: Vec<u8>) -> Self {
        let properties = DeliveryProperties {
            message_id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        };

        Self {
            payload,
            properties,
        }
    }

    /// Sets the content type of the message
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.properties.content_type = Some(content_type.to_owned());
        self
    }

    /// Adds a header to the message
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.properties
            .headers
            .insert(key.to_owned(), value.to_owned());
        self
    }
}

/// Counters describing the state of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    /// Messages waiting to be delivered
    pub ready: usize,
    /// Messages delivered but not yet resolved
    pub unacknowledged: usize,
    /// Messages which have been acknowledged (explicitly or automatically)
    pub acknowledged: usize,
    /// Messages which have been rejected and requeued
    pub rejected: usize,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    ready: VecDeque<MemoryMessage>,
    statistics: QueueStatistics,
}

#[derive(Debug, Default)]
pub(super) struct BrokerState {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
    activity: Arc<Notify>,
}

impl BrokerState {
    /// Wakes every consumer waiting for messages or free prefetch capacity
    pub(super) fn wake(&self) {
        self.activity.notify_waiters();
    }

    pub(super) fn declare_exchange(&mut self, name: &str) {
        self.exchanges.entry(name.to_owned()).or_default();
    }

    pub(super) fn declare_queue(&mut self, name: &str, durable: bool) {
        self.queues
            .entry(name.to_owned())
            .or_insert_with(|| QueueState {
                durable,
                ready: VecDeque::new(),
                statistics: QueueStatistics::default(),
            });
    }

    pub(super) fn bind(
        &mut self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), MemoryBrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(MemoryBrokerError::QueueNotFound(queue.to_owned()));
        }

        let bindings = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| MemoryBrokerError::ExchangeNotFound(exchange.to_owned()))?;

        let exists = bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern);

        if !exists {
            bindings.push(Binding {
                queue: queue.to_owned(),
                pattern: pattern.to_owned(),
            });
        }

        Ok(())
    }

    pub(super) fn has_queue(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    /// Takes the next message from the queue, marking it as in-flight if `tracked` is set
    pub(super) fn pop(&mut self, queue: &str, tracked: bool) -> Option<MemoryMessage> {
        let state = self.queues.get_mut(queue)?;
        let message = state.ready.pop_front()?;

        if tracked {
            state.statistics.unacknowledged += 1;
        } else {
            state.statistics.acknowledged += 1;
        }

        Some(message)
    }

    pub(super) fn settle(&mut self, queue: &str, count: usize) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.statistics.unacknowledged = state.statistics.unacknowledged.saturating_sub(count);
            state.statistics.acknowledged += count;
        }

        self.wake();
    }

    /// Puts an in-flight message back at the front of its queue
    pub(super) fn requeue(&mut self, queue: &str, mut message: MemoryMessage, rejected: bool) {
        if let Some(state) = self.queues.get_mut(queue) {
            message.properties.redelivered = true;
            state.statistics.unacknowledged = state.statistics.unacknowledged.saturating_sub(1);
            if rejected {
                state.statistics.rejected += 1;
            }
            state.ready.push_front(message);
        }

        self.wake();
    }

    fn enqueue(&mut self, queue: &str, message: MemoryMessage) -> Result<(), MemoryBrokerError> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| MemoryBrokerError::QueueNotFound(queue.to_owned()))?;

        state.ready.push_back(message);
        self.wake();

        Ok(())
    }
}

/// In-process broker which hands out [`MemoryConnections`](MemoryConnection)
///
/// Cloning the broker yields another handle to the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates a new, empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection to the broker
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::new(self.clone())
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal raised whenever a queue receives a message or a delivery is resolved
    pub(super) fn activity(&self) -> Arc<Notify> {
        self.lock().activity.clone()
    }

    /// Publishes a payload to an exchange and returns the number of queues it has been routed to
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<usize, MemoryBrokerError> {
        self.publish_message(exchange, routing_key, MemoryMessage::new(payload))
    }

    /// Publishes a message with custom properties to an exchange
    ///
    /// The exchange and routing key properties of the message are overwritten.
    /// Messages which match no binding are silently dropped.
    pub fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        mut message: MemoryMessage,
    ) -> Result<usize, MemoryBrokerError> {
        message.properties.exchange = exchange.to_owned();
        message.properties.routing_key = routing_key.to_owned();

        let mut state = self.lock();

        let mut targets: Vec<String> = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| MemoryBrokerError::ExchangeNotFound(exchange.to_owned()))?
            .iter()
            .filter(|binding| topic_matches(&binding.pattern, routing_key))
            .map(|binding| binding.queue.clone())
            .collect();

        // A queue bound with multiple matching patterns still receives only one copy
        targets.sort();
        targets.dedup();

        for queue in targets.iter() {
            state.enqueue(queue, message.clone())?;
        }

        trace!(exchange, routing_key, queues = targets.len(), "Routed message");

        Ok(targets.len())
    }

    /// Appends a message directly to the end of a queue, bypassing any exchange
    pub fn enqueue(&self, queue: &str, message: MemoryMessage) -> Result<(), MemoryBrokerError> {
        self.lock().enqueue(queue, message)
    }

    /// Current counters of a queue or `None` if it has not been declared
    pub fn statistics(&self, queue: &str) -> Option<QueueStatistics> {
        self.lock().queues.get(queue).map(|state| QueueStatistics {
            ready: state.ready.len(),
            ..state.statistics
        })
    }

    /// Names of all declared queues in alphabetical order
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Simulates a broker restart which discards all transient queues and their messages
    ///
    /// Connections are not affected, they should be closed beforehand.
    pub fn restart(&self) {
        let mut state = self.lock();

        state.queues.retain(|_, queue| queue.durable);
        let remaining: Vec<String> = state.queues.keys().cloned().collect();

        for bindings in state.exchanges.values_mut() {
            bindings.retain(|binding| remaining.contains(&binding.queue));
        }

        debug!(queues = remaining.len(), "Broker restarted");
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> Result<MemoryConnection, BoxedError> {
        debug!(virtual_host = %settings.virtual_host, "Connecting to in-memory broker");
        Ok(MemoryConnection::new(self.clone()))
    }
}
