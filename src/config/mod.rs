//! Configuration, identifiers and the error taxonomy.

pub mod loader;
pub mod types;
pub mod validator;

pub use loader::{RuntimeKind, SupervisorConfig, Toolchain};
