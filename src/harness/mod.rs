//! Runtime harness to execute subscribers as long-running processes

mod heart;
pub mod logging;
mod module;
mod terminator;

pub use heart::*;
pub use module::*;
pub use terminator::*;
