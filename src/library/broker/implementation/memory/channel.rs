use super::{MemoryBroker, MemoryBrokerError, MemoryMessage};
use crate::library::broker::{
    Channel, Connection, DeliveryProperties, DeliveryStream, RawDelivery, SubscriptionOptions,
};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

#[derive(Debug)]
struct Unacknowledged {
    queue: String,
    message: MemoryMessage,
}

#[derive(Debug, Default)]
struct ChannelInner {
    next_tag: u64,
    unacknowledged: BTreeMap<u64, Unacknowledged>,
}

#[derive(Debug)]
struct ChannelState {
    broker: MemoryBroker,
    prefetch: u16,
    closed: AtomicBool,
    inner: Mutex<ChannelInner>,
}

impl ChannelState {
    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), MemoryBrokerError> {
        if self.is_closed() {
            Err(MemoryBrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    /// Attempts to take the next message off a queue while honoring the prefetch limit
    fn next_delivery(
        self: &Arc<Self>,
        queue: &str,
        options: SubscriptionOptions,
    ) -> Option<MemoryDelivery> {
        let mut inner = self.lock();

        if options.manual_ack
            && self.prefetch > 0
            && inner.unacknowledged.len() >= self.prefetch as usize
        {
            return None;
        }

        let message = self.broker.lock().pop(queue, options.manual_ack)?;

        inner.next_tag += 1;
        let tag = inner.next_tag;

        if options.manual_ack {
            inner.unacknowledged.insert(
                tag,
                Unacknowledged {
                    queue: queue.to_owned(),
                    message: message.clone(),
                },
            );
        }

        trace!(queue, tag, "Delivering message");

        Some(MemoryDelivery {
            tag,
            message,
            channel: self.clone(),
        })
    }

    fn acknowledge(&self, tag: u64, multiple: bool) -> Result<(), MemoryBrokerError> {
        self.ensure_open()?;
        let mut inner = self.lock();

        if !inner.unacknowledged.contains_key(&tag) {
            return Err(MemoryBrokerError::UnknownDeliveryTag(tag));
        }

        let settled: Vec<Unacknowledged> = if multiple {
            let remaining = inner.unacknowledged.split_off(&(tag + 1));
            std::mem::replace(&mut inner.unacknowledged, remaining)
                .into_values()
                .collect()
        } else {
            inner.unacknowledged.remove(&tag).into_iter().collect()
        };

        let mut broker = self.broker.lock();
        for entry in settled {
            broker.settle(&entry.queue, 1);
        }

        Ok(())
    }

    fn reject(&self, tag: u64) -> Result<(), MemoryBrokerError> {
        self.ensure_open()?;
        let mut inner = self.lock();

        let entry = inner
            .unacknowledged
            .remove(&tag)
            .ok_or(MemoryBrokerError::UnknownDeliveryTag(tag))?;

        self.broker
            .lock()
            .requeue(&entry.queue, entry.message, true);

        Ok(())
    }

    /// Closes the channel and returns all outstanding deliveries to their queues in their original order
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut inner = self.lock();
        let outstanding = std::mem::take(&mut inner.unacknowledged);
        let mut broker = self.broker.lock();

        debug!(released = outstanding.len(), "Closing channel");

        for (_, entry) in outstanding.into_iter().rev() {
            broker.requeue(&entry.queue, entry.message, false);
        }

        // Consumers of this channel have to observe the closure
        broker.wake();
    }
}

/// Delivery received through a [`MemoryChannel`]
#[derive(Debug)]
pub struct MemoryDelivery {
    tag: u64,
    message: MemoryMessage,
    channel: Arc<ChannelState>,
}

#[async_trait]
impl RawDelivery for MemoryDelivery {
    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn properties(&self) -> &DeliveryProperties {
        &self.message.properties
    }

    async fn acknowledge(&self, multiple: bool) -> EmptyResult {
        self.channel.acknowledge(self.tag, multiple)?;
        Ok(())
    }

    async fn reject(&self) -> EmptyResult {
        self.channel.reject(self.tag)?;
        Ok(())
    }
}

/// Channel opened on a [`MemoryConnection`]
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    state: Arc<ChannelState>,
}

impl MemoryChannel {
    /// Number of deliveries on this channel which have not been resolved yet
    pub fn unacknowledged(&self) -> usize {
        self.state.lock().unacknowledged.len()
    }

    /// Closes the channel, releasing all unacknowledged deliveries
    pub fn close(&self) {
        self.state.close();
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn declare_topic_exchange(&self, name: &str) -> EmptyResult {
        self.state.ensure_open()?;
        self.state.broker.lock().declare_exchange(name);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> EmptyResult {
        self.state.ensure_open()?;
        self.state.broker.lock().declare_queue(name, durable);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> EmptyResult {
        self.state.ensure_open()?;
        self.state.broker.lock().bind(queue, exchange, routing_key)?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: SubscriptionOptions,
    ) -> Result<DeliveryStream<Self::Delivery>, BoxedError> {
        self.state.ensure_open()?;

        if !self.state.broker.lock().has_queue(queue) {
            return Err(MemoryBrokerError::QueueNotFound(queue.to_owned()).into());
        }

        let seed = (self.state.clone(), queue.to_owned());
        let deliveries = stream::unfold(seed, move |(state, queue)| async move {
            let activity = state.broker.activity();

            loop {
                // Registered before checking so that no wake-up in between is lost
                let notified = activity.notified();

                if state.is_closed() {
                    return None;
                }

                if let Some(delivery) = state.next_delivery(&queue, options) {
                    return Some((Ok::<_, BoxedError>(delivery), (state, queue)));
                }

                notified.await;
            }
        });

        Ok(deliveries.boxed())
    }
}

/// Connection to a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: AtomicBool,
    channels: Mutex<Vec<Arc<ChannelState>>>,
}

impl MemoryConnection {
    pub(super) fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Whether [`Connection::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn channels(&self) -> MutexGuard<'_, Vec<Arc<ChannelState>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self, prefetch: u16) -> Result<Self::Channel, BoxedError> {
        if self.is_closed() {
            return Err(MemoryBrokerError::ConnectionClosed.into());
        }

        let state = Arc::new(ChannelState {
            broker: self.broker.clone(),
            prefetch,
            closed: AtomicBool::new(false),
            inner: Mutex::new(ChannelInner::default()),
        });

        self.channels().push(state.clone());

        Ok(MemoryChannel { state })
    }

    async fn close(&self) -> EmptyResult {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(MemoryBrokerError::ConnectionClosed.into());
        }

        for channel in self.channels().drain(..) {
            channel.close();
        }

        Ok(())
    }
}
