//! Utilities
//!
//! Bounded subprocess execution, output handling and durable writes shared by
//! the validator, installer, runtimes and store.

pub mod atomic;
pub mod output;
pub mod subprocess;
