use crate::domain::SubscriptionSet;
use crate::harness::{Heart, HeartStone, Module};
use crate::library::broker::Connection;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use jatsl::JobScheduler;
use std::time::Duration;
use tracing::{error, info};

/// Module serving a [`SubscriptionSet`] until the process is asked to terminate
///
/// Subscriptions are started during startup. On shutdown the consumers stop taking new
/// deliveries and those which are already being processed are given the graceful shutdown
/// period to finish. Only then is the connection closed, releasing everything left over.
pub struct SubscriberModule<C>
where
    C: Connection,
{
    set: SubscriptionSet<C>,
    graceful_shutdown: Duration,
    heart: Option<Heart>,
    stone: HeartStone,
}

impl<C> SubscriberModule<C>
where
    C: Connection,
{
    /// Creates a new module for the given set
    pub fn new(set: SubscriptionSet<C>, graceful_shutdown: Duration) -> Self {
        let (heart, stone) = Heart::new();

        Self {
            set,
            graceful_shutdown,
            heart: Some(heart),
            stone,
        }
    }

    /// Remote control which stops the module when killed
    pub fn heart_stone(&self) -> HeartStone {
        self.stone.clone()
    }

    /// Subscriptions served by the module
    pub fn subscriptions(&self) -> &SubscriptionSet<C> {
        &self.set
    }
}

#[async_trait]
impl<C> Module for SubscriberModule<C>
where
    C: Connection,
{
    async fn pre_startup(&mut self) -> EmptyResult {
        self.set.start().await?;
        Ok(())
    }

    async fn run(&mut self, _scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError> {
        info!(routes = self.set.routes().len(), "Subscriber running");
        Ok(self.heart.take())
    }

    async fn pre_shutdown(&mut self, _scheduler: &JobScheduler) {
        if let Err(error) = self.set.shutdown(self.graceful_shutdown).await {
            error!(%error, "Failed to stop subscriptions");
        }
    }
}
