//! Subscription specific structures and logic
//!
//! A subscriber is declared through a [`SubscriberBuilder`], which yields one [`Route`] per action.
//! Those routes are handed to a [`SubscriptionSet`] which provisions the broker resources and
//! dispatches every delivery, wrapped in a [`DeliveryEnvironment`], onto the route's worker pool.
//! There, the [`AcknowledgementEngine`] executes the action and resolves the delivery.

mod acknowledgement;
mod environment;
mod filter;
mod retry;
mod route;
mod subscriber;
mod subscription_set;

#[cfg(test)]
pub mod mock;

pub use acknowledgement::*;
pub use environment::*;
pub use filter::*;
pub use retry::*;
pub use route::*;
pub use subscriber::*;
pub use subscription_set::*;
