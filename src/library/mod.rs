//! Independent and project agnostic libraries
//!
//! Ideally, any of the library submodules in this module can be extracted into their own crate
//! at any given time. They power the core functionality of the subscriber, however, nothing in
//! here knows about routes or acknowledgement contracts; that has been extracted into the
//! [`domain`](super::domain) module.

pub mod backoff;
pub mod broker;
pub mod helpers;
pub mod pool;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
