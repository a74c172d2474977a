//! Implementations of the broker traits

pub mod memory;

#[cfg(test)]
pub mod mock;
