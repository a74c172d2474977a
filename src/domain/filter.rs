//! Chains of behaviours wrapping the execution of an action
//!
//! The same structure is used for two purposes:
//!
//! - **Around filters** declared on a subscriber wrap the action handler itself
//! - **Middleware** attached to a route wraps the whole acknowledgement procedure
//!
//! Filters run in declaration order from the outside in, meaning that the last filter
//! in a chain is closest to the wrapped endpoint. A chain of `[A, B]` executes as `A(B(endpoint))`.

use super::{DeliveryEnvironment, Handler};
use crate::library::EmptyResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, trace};

/// Behaviour which is invoked before and after the remainder of a [`FilterChain`]
#[async_trait]
pub trait Filter: Send + Sync {
    /// Identifier of the filter, unique within a chain
    fn name(&self) -> &str;

    /// Executes the filter. Calling [`Next::run`] continues with the rest of the chain,
    /// not calling it skips everything further inwards.
    async fn call(&self, environment: &DeliveryEnvironment, next: Next<'_>) -> EmptyResult;
}

/// Remainder of a [`FilterChain`] including its endpoint
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
    endpoint: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Continues with the next filter or invokes the endpoint at the end of the chain
    pub async fn run(self, environment: &DeliveryEnvironment) -> EmptyResult {
        match self.filters.split_first() {
            Some((filter, filters)) => {
                trace!(filter = filter.name(), "Entering filter");
                let next = Next {
                    filters,
                    endpoint: self.endpoint,
                };

                filter.call(environment, next).await
            }
            None => self.endpoint.handle(environment).await,
        }
    }
}

/// Error raised when modifying a [`FilterChain`]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterChainError {
    /// Referenced filter is not part of the chain
    #[error("no filter named '{0}' in chain")]
    UnknownFilter(String),
    /// Filter with the same name is already part of the chain
    #[error("filter '{0}' is already part of the chain")]
    DuplicateFilter(String),
    /// Index lies past the end of the chain
    #[error("index {index} is out of bounds for chain of length {length}")]
    OutOfBounds {
        /// Requested position
        index: usize,
        /// Current length of the chain
        length: usize,
    },
}

/// Ordered sequence of [`Filters`](Filter)
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// Creates an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter as the new innermost entry.
    /// Filters whose name is already present are ignored and `false` is returned.
    pub fn push(&mut self, filter: Arc<dyn Filter>) -> bool {
        if self.contains(filter.name()) {
            return false;
        }

        self.filters.push(filter);
        true
    }

    /// Inserts a filter at the given position
    pub fn insert(&mut self, index: usize, filter: Arc<dyn Filter>) -> Result<(), FilterChainError> {
        if self.contains(filter.name()) {
            return Err(FilterChainError::DuplicateFilter(filter.name().to_owned()));
        }

        if index > self.filters.len() {
            return Err(FilterChainError::OutOfBounds {
                index,
                length: self.filters.len(),
            });
        }

        self.filters.insert(index, filter);
        Ok(())
    }

    /// Inserts a filter directly outside of the named one
    pub fn insert_before(&mut self, name: &str, filter: Arc<dyn Filter>) -> Result<(), FilterChainError> {
        let index = self.position(name)?;
        self.insert(index, filter)
    }

    /// Inserts a filter directly inside of the named one
    pub fn insert_after(&mut self, name: &str, filter: Arc<dyn Filter>) -> Result<(), FilterChainError> {
        let index = self.position(name)?;
        self.insert(index + 1, filter)
    }

    /// Removes the named filter, returning whether it was present
    pub fn remove(&mut self, name: &str) -> bool {
        let length = self.filters.len();
        self.filters.retain(|filter| filter.name() != name);
        length != self.filters.len()
    }

    /// Whether a filter with the given name is part of the chain
    pub fn contains(&self, name: &str) -> bool {
        self.filters.iter().any(|filter| filter.name() == name)
    }

    /// Names of all filters from the outermost to the innermost
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// Number of filters in the chain
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain contains no filters
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the chain around the given endpoint
    pub async fn run(&self, environment: &DeliveryEnvironment, endpoint: &dyn Handler) -> EmptyResult {
        Next {
            filters: &self.filters,
            endpoint,
        }
        .run(environment)
        .await
    }

    fn position(&self, name: &str) -> Result<usize, FilterChainError> {
        self.filters
            .iter()
            .position(|filter| filter.name() == name)
            .ok_or_else(|| FilterChainError::UnknownFilter(name.to_owned()))
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Middleware which logs failures of the wrapped procedure along with the delivery context
///
/// The failure is consumed, nothing further outwards will observe it.
#[derive(Debug, Default)]
pub struct ErrorLogger;

impl ErrorLogger {
    /// Name under which the middleware is registered
    pub const NAME: &'static str = "error_logger";
}

#[async_trait]
impl Filter for ErrorLogger {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn call(&self, environment: &DeliveryEnvironment, next: Next<'_>) -> EmptyResult {
        if let Err(error) = next.run(environment).await {
            error!(
                action = environment.action(),
                queue = environment.queue(),
                tag = environment.delivery_tag(),
                routing_key = environment.routing_key(),
                %error,
                "Failed to process delivery"
            );
        }

        Ok(())
    }
}
