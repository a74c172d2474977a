use super::{AcknowledgementMode, DeliveryEnvironment, ErrorLogger, Filter, FilterChain, Route};
use crate::library::pool::WorkerPool;
use crate::library::EmptyResult;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Code executed for every delivery of an action
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes a single delivery
    async fn handle(&self, environment: &DeliveryEnvironment) -> EmptyResult;
}

/// Error in the declaration of a subscriber
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeclarationError {
    /// Action has been declared more than once
    #[error("action '{0}' has been declared multiple times")]
    DuplicateAction(String),
    /// Action name is empty
    #[error("actions require a non-empty name")]
    EmptyAction,
    /// Queue or routing key override references an action which has not been declared
    #[error("override references undeclared action '{0}'")]
    UndeclaredAction(String),
}

/// Process wide settings applied to routes which do not override them
#[derive(Debug, Clone)]
pub struct RouteDefaults {
    /// Exchange used when a subscriber does not name one
    pub exchange: String,
    /// Prefetch limit of each route's channel
    pub prefetch: u16,
    /// Whether queues survive broker restarts
    pub durable: bool,
    /// Name of the consuming application, prepended to generated queue names
    pub local_application_name: Option<String>,
    /// Middleware every route starts out with
    pub middleware: FilterChain,
    /// Pool used by subscribers which do not request a dedicated one
    pub worker_pool: WorkerPool,
}

impl RouteDefaults {
    /// Default settings using the given worker pool
    pub fn new(worker_pool: WorkerPool) -> Self {
        let mut middleware = FilterChain::new();
        middleware.push(Arc::new(ErrorLogger));

        Self {
            exchange: "events".to_owned(),
            prefetch: 5,
            durable: false,
            local_application_name: None,
            middleware,
            worker_pool,
        }
    }
}

/// Declaration of a set of actions sharing their broker settings
///
/// ```ignore
/// let subscriber = SubscriberBuilder::new("users")
///     .publisher("accounts")
///     .at_most_once(10)
///     .around_filter(Arc::new(Timing))
///     .action("created", Arc::new(UserCreated))
///     .action("deleted", Arc::new(UserDeleted))
///     .queue_for("deleted", "accounts.users.deleted.audit")
///     .build(&defaults)?;
/// ```
#[must_use]
pub struct SubscriberBuilder {
    resource: String,
    publisher: Option<String>,
    exchange: Option<String>,
    actions: Vec<(String, Arc<dyn Handler>)>,
    queues: HashMap<String, String>,
    routing_keys: HashMap<String, String>,
    around_filters: FilterChain,
    middleware: Vec<Arc<dyn Filter>>,
    acknowledgement_mode: AcknowledgementMode,
    prefetch: Option<u16>,
    durable: Option<bool>,
    worker_pool: Option<WorkerPool>,
}

impl SubscriberBuilder {
    /// Starts the declaration of a subscriber for the given resource
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_owned(),
            publisher: None,
            exchange: None,
            actions: Vec::new(),
            queues: HashMap::new(),
            routing_keys: HashMap::new(),
            around_filters: FilterChain::new(),
            middleware: Vec::new(),
            acknowledgement_mode: AcknowledgementMode::None,
            prefetch: None,
            durable: None,
            worker_pool: None,
        }
    }

    /// Name of the application publishing the consumed messages
    pub fn publisher(mut self, name: &str) -> Self {
        self.publisher = Some(name.to_owned());
        self
    }

    /// Exchange to bind to instead of the default one
    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange = Some(name.to_owned());
        self
    }

    /// Declares an action
    pub fn action(mut self, name: &str, handler: Arc<dyn Handler>) -> Self {
        self.actions.push((name.to_owned(), handler));
        self
    }

    /// Overrides the queue consumed by an action
    pub fn queue_for(mut self, action: &str, queue: &str) -> Self {
        self.queues.insert(action.to_owned(), queue.to_owned());
        self
    }

    /// Overrides the routing key an action's queue is bound with
    pub fn routing_key_for(mut self, action: &str, routing_key: &str) -> Self {
        self.routing_keys
            .insert(action.to_owned(), routing_key.to_owned());
        self
    }

    /// Adds a filter around all actions, unless one with the same name exists already
    pub fn around_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.around_filters.push(filter);
        self
    }

    /// Appends middleware to the routes of this subscriber on top of the default middleware
    pub fn middleware(mut self, filter: Arc<dyn Filter>) -> Self {
        self.middleware.push(filter);
        self
    }

    /// Lets the broker consider deliveries acknowledged as soon as they are sent
    pub fn no_acknowledgement(mut self) -> Self {
        self.acknowledgement_mode = AcknowledgementMode::None;
        self
    }

    /// Acknowledges deliveries once processed, scheduling a redelivery on failure
    pub fn at_least_once(mut self) -> Self {
        self.acknowledgement_mode = AcknowledgementMode::AtLeastOnce;
        self
    }

    /// Acknowledges deliveries before processing them, in groups of `every` messages
    pub fn at_most_once(mut self, every: u64) -> Self {
        self.acknowledgement_mode = AcknowledgementMode::at_most_once(every);
        self
    }

    /// Leaves the resolution of deliveries to the handlers
    pub fn manual_acknowledgement(mut self) -> Self {
        self.acknowledgement_mode = AcknowledgementMode::Manual;
        self
    }

    /// Overrides the default prefetch limit
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Overrides the default queue durability
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Processes deliveries on a dedicated pool instead of the default one
    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    /// Validates the declaration and creates one route per action
    pub fn build(self, defaults: &RouteDefaults) -> Result<Subscriber, DeclarationError> {
        let mut declared = HashSet::new();

        for (action, _) in self.actions.iter() {
            if action.is_empty() {
                return Err(DeclarationError::EmptyAction);
            }

            if !declared.insert(action.as_str()) {
                return Err(DeclarationError::DuplicateAction(action.clone()));
            }
        }

        if let Some(action) = self
            .queues
            .keys()
            .chain(self.routing_keys.keys())
            .find(|action| !declared.contains(action.as_str()))
        {
            return Err(DeclarationError::UndeclaredAction(action.clone()));
        }

        let mut middleware = defaults.middleware.clone();
        for filter in self.middleware.iter() {
            middleware.push(filter.clone());
        }

        let exchange = self
            .exchange
            .clone()
            .unwrap_or_else(|| defaults.exchange.clone());
        let worker_pool = self
            .worker_pool
            .clone()
            .unwrap_or_else(|| defaults.worker_pool.clone());

        let routes = self
            .actions
            .iter()
            .map(|(action, handler)| {
                let routing_key = self
                    .routing_keys
                    .get(action)
                    .cloned()
                    .unwrap_or_else(|| self.qualified_name(action));

                let queue = self.queues.get(action).cloned().unwrap_or_else(|| {
                    match &defaults.local_application_name {
                        Some(local) => format!("{}.{}", local, self.qualified_name(action)),
                        None => self.qualified_name(action),
                    }
                });

                Route {
                    action: action.clone(),
                    handler: handler.clone(),
                    exchange: exchange.clone(),
                    queue,
                    routing_key,
                    durable: self.durable.unwrap_or(defaults.durable),
                    prefetch: self.prefetch.unwrap_or(defaults.prefetch),
                    acknowledgement_mode: self.acknowledgement_mode,
                    around_filters: self.around_filters.clone(),
                    middleware: middleware.clone(),
                    worker_pool: worker_pool.clone(),
                }
            })
            .collect();

        Ok(Subscriber {
            resource: self.resource,
            routes,
        })
    }

    /// `[publisher.]resource.action`
    fn qualified_name(&self, action: &str) -> String {
        match &self.publisher {
            Some(publisher) => format!("{}.{}.{}", publisher, self.resource, action),
            None => format!("{}.{}", self.resource, action),
        }
    }
}

/// Finalized declaration of a subscriber
#[derive(Debug, Clone)]
pub struct Subscriber {
    resource: String,
    routes: Vec<Route>,
}

impl Subscriber {
    /// Resource the subscriber consumes messages about
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Routes in the order their actions have been declared
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Route of the named action
    pub fn route(&self, action: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.action() == action)
    }

    /// Consumes the subscriber, returning its routes
    pub fn into_routes(self) -> Vec<Route> {
        self.routes
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::mock::{RecordingFilter, RecordingHandler};
    use crate::library::broker::implementation::mock::MockRecorder;
    use crate::library::broker::SubscriptionOptions;
    use pretty_assertions::assert_eq;

    fn defaults() -> RouteDefaults {
        RouteDefaults::new(WorkerPool::new("default", 4))
    }

    fn handler() -> Arc<dyn Handler> {
        Arc::new(RecordingHandler::new(&MockRecorder::default()))
    }

    #[test]
    fn derive_names_from_resource_and_publisher() {
        let subscriber = SubscriberBuilder::new("users")
            .publisher("accounts")
            .action("created", handler())
            .build(&defaults())
            .unwrap();

        let route = subscriber.route("created").unwrap();
        assert_eq!(route.exchange(), "events");
        assert_eq!(route.routing_key(), "accounts.users.created");
        assert_eq!(route.queue(), "accounts.users.created");
        assert_eq!(route.prefetch(), 5);
        assert!(!route.durable());
    }

    #[test]
    fn prefix_queues_with_local_application() {
        let mut defaults = defaults();
        defaults.local_application_name = Some("billing".into());

        let subscriber = SubscriberBuilder::new("users")
            .action("created", handler())
            .build(&defaults)
            .unwrap();

        let route = subscriber.route("created").unwrap();
        assert_eq!(route.routing_key(), "users.created");
        assert_eq!(route.queue(), "billing.users.created");
    }

    #[test]
    fn apply_overrides() {
        let pool = WorkerPool::new("dedicated", 1);
        let subscriber = SubscriberBuilder::new("users")
            .exchange("legacy")
            .action("created", handler())
            .action("deleted", handler())
            .queue_for("created", "custom.queue")
            .routing_key_for("deleted", "users.*.deleted")
            .prefetch(1)
            .durable(true)
            .worker_pool(pool)
            .build(&defaults())
            .unwrap();

        let created = subscriber.route("created").unwrap();
        let deleted = subscriber.route("deleted").unwrap();

        assert_eq!(created.queue(), "custom.queue");
        assert_eq!(created.routing_key(), "users.created");
        assert_eq!(deleted.queue(), "users.deleted");
        assert_eq!(deleted.routing_key(), "users.*.deleted");
        assert_eq!(deleted.exchange(), "legacy");
        assert_eq!(deleted.prefetch(), 1);
        assert!(deleted.durable());
        assert_eq!(deleted.worker_pool().name(), "dedicated");
    }

    #[test]
    fn use_the_last_acknowledgement_mode() {
        let subscriber = SubscriberBuilder::new("users")
            .at_least_once()
            .at_most_once(1)
            .action("created", handler())
            .build(&defaults())
            .unwrap();
        let route = subscriber.route("created").unwrap();

        assert_eq!(
            route.acknowledgement_mode(),
            AcknowledgementMode::AtMostOnceSingle
        );
        assert_eq!(
            route.queue_subscription_options(),
            SubscriptionOptions { manual_ack: true }
        );

        let subscriber = SubscriberBuilder::new("users")
            .manual_acknowledgement()
            .no_acknowledgement()
            .action("created", handler())
            .build(&defaults())
            .unwrap();

        assert_eq!(
            subscriber.routes()[0].queue_subscription_options(),
            SubscriptionOptions { manual_ack: false }
        );
    }

    #[test]
    fn share_filters_and_extend_middleware() {
        let recorder = MockRecorder::default();
        let subscriber = SubscriberBuilder::new("users")
            .around_filter(Arc::new(RecordingFilter::new("A", &recorder)))
            .around_filter(Arc::new(RecordingFilter::new("B", &recorder)))
            .around_filter(Arc::new(RecordingFilter::new("A", &recorder)))
            .middleware(Arc::new(RecordingFilter::new("timing", &recorder)))
            .action("created", handler())
            .action("deleted", handler())
            .build(&defaults())
            .unwrap();

        for route in subscriber.routes() {
            assert_eq!(route.around_filters().names(), vec!["A", "B"]);
            assert_eq!(
                route.middleware().names(),
                vec![ErrorLogger::NAME, "timing"]
            );
        }
    }

    #[test]
    fn reject_invalid_declarations() {
        let duplicate = SubscriberBuilder::new("users")
            .action("created", handler())
            .action("created", handler())
            .build(&defaults());
        assert_eq!(
            duplicate.unwrap_err(),
            DeclarationError::DuplicateAction("created".into())
        );

        let empty = SubscriberBuilder::new("users")
            .action("", handler())
            .build(&defaults());
        assert_eq!(empty.unwrap_err(), DeclarationError::EmptyAction);

        let undeclared = SubscriberBuilder::new("users")
            .action("created", handler())
            .routing_key_for("deleted", "users.deleted")
            .build(&defaults());
        assert_eq!(
            undeclared.unwrap_err(),
            DeclarationError::UndeclaredAction("deleted".into())
        );
    }
}
