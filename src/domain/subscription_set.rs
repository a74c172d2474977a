use super::{AcknowledgementEngine, DeliveryEnvironment, Handler, Route};
use crate::library::broker::{Channel, Connection, DeliveryStream};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::lock::Mutex;
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Step of provisioning the broker resources of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    /// Opening the route's channel
    OpenChannel,
    /// Declaring the topic exchange
    DeclareExchange,
    /// Declaring the queue
    DeclareQueue,
    /// Binding the queue to the exchange
    BindQueue,
    /// Registering the consumer
    Consume,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            SetupStage::OpenChannel => "open channel",
            SetupStage::DeclareExchange => "declare exchange",
            SetupStage::DeclareQueue => "declare queue",
            SetupStage::BindQueue => "bind queue",
            SetupStage::Consume => "consume queue",
        };

        f.write_str(stage)
    }
}

/// Error raised while starting or stopping a [`SubscriptionSet`]
#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// Set has been started before
    #[error("subscription set has already been started")]
    AlreadyStarted,
    /// Broker resources of a route could not be provisioned
    #[error("failed to {stage} for action '{action}'")]
    Setup {
        /// Action of the affected route
        action: String,
        /// Step which failed
        stage: SetupStage,
        /// Underlying broker error
        #[source]
        source: BoxedError,
    },
    /// Connection could not be closed
    #[error("failed to close broker connection")]
    Close(#[source] BoxedError),
}

/// Consumers for a set of routes sharing one broker connection
pub struct SubscriptionSet<C>
where
    C: Connection,
{
    connection: C,
    routes: Vec<Arc<Route>>,
    engine: Arc<AcknowledgementEngine>,
    started: AtomicBool,
    consumers: Mutex<Vec<JoinHandle<C::Channel>>>,
    /// Channels of stopped consumers, kept open until the connection is closed
    idle_channels: Mutex<Vec<C::Channel>>,
    shutdown: watch::Sender<bool>,
    shutdown_signal: watch::Receiver<bool>,
}

impl<C> SubscriptionSet<C>
where
    C: Connection,
{
    /// Creates a new set, nothing is provisioned until it is [started](SubscriptionSet::start)
    pub fn new(connection: C, routes: Vec<Route>, engine: AcknowledgementEngine) -> Self {
        let (shutdown, shutdown_signal) = watch::channel(false);

        Self {
            connection,
            routes: routes.into_iter().map(Arc::new).collect(),
            engine: Arc::new(engine),
            started: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            idle_channels: Mutex::new(Vec::new()),
            shutdown,
            shutdown_signal,
        }
    }

    /// Routes served by this set
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Connection used by this set
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Provisions channel, exchange, queue and binding for every route and starts consuming.
    ///
    /// Consumers of routes that have been set up before a failure keep running until [`stop`](SubscriptionSet::stop) is called.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SubscriptionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SubscriptionError::AlreadyStarted);
        }

        for route in self.routes.iter() {
            let (channel, deliveries) = self.setup(route).await?;

            let span = tracing::info_span!("consumer", action = route.action(), queue = route.queue());
            let consumer = consume(
                route.clone(),
                self.engine.clone(),
                channel,
                deliveries,
                self.shutdown_signal.clone(),
            );

            self.consumers
                .lock()
                .await
                .push(tokio::spawn(consumer.instrument(span)));
        }

        info!(routes = self.routes.len(), "Subscriptions started");

        Ok(())
    }

    /// Stops taking deliveries off the queues and waits for all consumers to finish.
    ///
    /// Channels and the connection stay open, deliveries which are being processed can still be resolved.
    #[instrument(skip(self))]
    pub async fn stop_consuming(&self) {
        // The set holds a receiver itself, sending can not fail
        self.shutdown.send(true).ok();

        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        let mut channels = Vec::with_capacity(consumers.len());

        for consumer in consumers {
            match consumer.await {
                Ok(channel) => channels.push(channel),
                Err(error) => warn!(%error, "Consumer terminated abnormally"),
            }
        }

        debug!(channels = channels.len(), "Consumers stopped");
        self.idle_channels.lock().await.extend(channels);
    }

    /// Stops consuming and closes the connection, which releases every delivery that has not been resolved.
    ///
    /// Workers still processing a delivery at this point can no longer resolve it. Use
    /// [`shutdown`](SubscriptionSet::shutdown) to give them a chance to finish first.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), SubscriptionError> {
        self.stop_consuming().await;

        self.connection
            .close()
            .await
            .map_err(SubscriptionError::Close)?;

        self.idle_channels.lock().await.clear();
        info!("Subscriptions stopped");

        Ok(())
    }

    /// Stops consuming, waits up to `grace` for in-flight deliveries to be resolved and closes the connection
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> Result<(), SubscriptionError> {
        self.stop_consuming().await;

        info!(timeout = ?grace, "Waiting for workers to finish");
        if timeout(grace, self.wait_for_workers()).await.is_err() {
            warn!("Workers did not finish within the graceful shutdown period");
        }

        self.stop().await
    }

    /// Waits until every delivery handed to a worker pool has been processed
    pub async fn wait_for_workers(&self) {
        let mut visited = HashSet::new();

        for route in self.routes.iter() {
            let pool = route.worker_pool();

            if visited.insert(pool.name().to_owned()) {
                debug!(pool = pool.name(), pending = pool.pending(), "Draining worker pool");
                pool.wait_idle().await;
            }
        }
    }

    async fn setup(
        &self,
        route: &Route,
    ) -> Result<(C::Channel, DeliveryStream<<C::Channel as Channel>::Delivery>), SubscriptionError> {
        let failed = |stage| {
            let action = route.action().to_owned();
            move |source| SubscriptionError::Setup {
                action,
                stage,
                source,
            }
        };

        let channel = self
            .connection
            .create_channel(route.prefetch())
            .await
            .map_err(failed(SetupStage::OpenChannel))?;

        channel
            .declare_topic_exchange(route.exchange())
            .await
            .map_err(failed(SetupStage::DeclareExchange))?;

        channel
            .declare_queue(route.queue(), route.durable())
            .await
            .map_err(failed(SetupStage::DeclareQueue))?;

        channel
            .bind_queue(route.queue(), route.exchange(), route.routing_key())
            .await
            .map_err(failed(SetupStage::BindQueue))?;

        let deliveries = channel
            .consume(route.queue(), route.queue_subscription_options())
            .await
            .map_err(failed(SetupStage::Consume))?;

        debug!(
            action = route.action(),
            exchange = route.exchange(),
            queue = route.queue(),
            routing_key = route.routing_key(),
            prefetch = route.prefetch(),
            "Route provisioned"
        );

        Ok((channel, deliveries))
    }
}

/// Hands every delivery of a stream to the route's worker pool until the stream ends or a shutdown is signalled.
/// The channel is handed back so that it outlives the deliveries still being processed.
async fn consume<Ch>(
    route: Arc<Route>,
    engine: Arc<AcknowledgementEngine>,
    channel: Ch,
    mut deliveries: DeliveryStream<Ch::Delivery>,
    mut shutdown: watch::Receiver<bool>,
) -> Ch
where
    Ch: Channel,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let item = tokio::select! {
            item = deliveries.next() => item,
            changed = shutdown.changed() => match changed {
                Ok(_) => continue,
                // Set has been dropped
                Err(_) => None,
            },
        };

        let item = match item {
            Some(item) => item,
            None => break,
        };

        match item {
            Ok(delivery) => {
                let environment =
                    DeliveryEnvironment::new(route.action(), route.queue(), Box::new(delivery));
                let route = route.clone();
                let engine = engine.clone();

                route
                    .worker_pool()
                    .clone()
                    .submit(dispatch(route, engine, environment));
            }
            Err(error) => warn!(%error, "Failed to receive delivery"),
        }
    }

    debug!("Consumer stopped");
    channel
}

/// Runs the route's middleware around the acknowledgement engine
///
/// Deliveries which never reach the engine, because a middleware returned early or panicked,
/// are finalized here so that they do not keep occupying the channel's prefetch capacity.
async fn dispatch(route: Arc<Route>, engine: Arc<AcknowledgementEngine>, environment: DeliveryEnvironment) {
    let endpoint = EngineEndpoint {
        route: &route,
        engine: &engine,
        reached: AtomicBool::new(false),
    };

    let result = AssertUnwindSafe(route.middleware().run(&environment, &endpoint))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => error!(
            action = route.action(),
            tag = environment.delivery_tag(),
            %error,
            "Failed to process delivery"
        ),
        Err(_) => error!(
            action = route.action(),
            tag = environment.delivery_tag(),
            "Middleware panicked while processing delivery"
        ),
    }

    if !endpoint.reached.load(Ordering::SeqCst) && route.acknowledge_messages() {
        debug!(
            action = route.action(),
            tag = environment.delivery_tag(),
            "Delivery did not reach the engine"
        );
        engine.finalize(&environment).await;
    }
}

struct EngineEndpoint<'a> {
    route: &'a Route,
    engine: &'a AcknowledgementEngine,
    reached: AtomicBool,
}

#[async_trait]
impl Handler for EngineEndpoint<'_> {
    async fn handle(&self, environment: &DeliveryEnvironment) -> EmptyResult {
        self.reached.store(true, Ordering::SeqCst);
        self.engine.execute(self.route, environment).await
    }
}
