//! Runnable modules built on top of the [`harness`](crate::harness)

pub mod options;
mod subscriber;

pub use options::Configuration;
pub use subscriber::SubscriberModule;
