//! This library crate contains everything needed to consume messages from a topic-exchange broker.
//!
//! Submodules have been introduced to split responsibilities. Each module has a specific focus
//! and they together form a chain of dependencies from the low-level [`library`], over the
//! subscription specific [`domain`] logic (routes, acknowledgement contracts and the subscription set),
//! through the executable [`harness`], up to the runnable [`module`] which ties it all together.
//!
//! A minimal subscriber looks like this:
//!
//! ```ignore
//! let config = Configuration::from_args();
//! logging::init(&config.log, config.log_format)?;
//!
//! let pools = config.worker_pools();
//! let subscriber = SubscriberBuilder::new("users")
//!     .publisher("accounts")
//!     .at_least_once()
//!     .action("created", Arc::new(UserCreated))
//!     .build(&config.route_defaults(&pools))?;
//!
//! let connection = config.connect(&broker).await?;
//! let engine = AcknowledgementEngine::new(Arc::new(retry), Arc::new(SignalTerminator));
//! let set = SubscriptionSet::new(connection, subscriber.into_routes(), engine);
//!
//! ModuleRunner::default()
//!     .run(SubscriberModule::new(set, config.seconds_to_wait_for_graceful_shutdown))
//!     .await;
//! ```

#![deny(missing_docs)]

pub mod domain;
pub mod harness;
pub mod library;
pub mod module;
