//! botbox: single-node supervisor for user-uploaded bot scripts
//!
//! Users upload a Python or JavaScript program (a single file or a zip
//! archive). botbox validates it, keeps a metadata record, and runs it
//! long-lived inside an isolated, resource-bounded execution context.
//!
//! # Architecture
//!
//! ## Lifecycle Core ([`core`])
//! - [`core::supervisor`]: Authorization, per-bot serialization, state machine
//! - [`core::handles`]: In-memory table of live execution handles
//!
//! ## Isolation Runtimes ([`runtime`])
//! - [`runtime::native`]: Keeper-supervised processes bounded by cgroup v2
//! - [`runtime::docker`]: Containers driven through the docker CLI
//! - [`runtime::keeper`]: Restart loop run by the re-executed binary
//!
//! ## Metadata ([`store`])
//! - [`store::json_file`]: flock-guarded JSON document store
//! - [`store::memory`]: In-process store for embedding and tests
//!
//! ## Uploads & Packages
//! - [`safety::workspace`]: Staging, archive extraction, workspace commit
//! - [`validate`]: Parse-only syntax checking through the language toolchain
//! - [`install`]: Package installation into a workspace
//! - [`lang`]: Per-language adapters
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: cgroup v2 limits, accounting and kill
//! - [`kernel::signal`]: Signal handling and process-group termination
//! - [`kernel::procfs`]: Process liveness from `/proc`
//!
//! ## Observability ([`observability`], [`monitor`])
//! - [`observability::metrics`]: Prometheus metrics export
//! - [`monitor`]: CPU and memory usage from counter snapshots
//!
//! # Design Principles
//!
//! 1. **Store is the record, runtime is the truth** - `running` is reconciled
//!    against the runtime whenever a bot is looked at
//! 2. **One writer per bot** - every mutation holds the bot's file lock
//! 3. **Nothing orphaned** - no record without a workspace, no context
//!    without a record

// Kernel Primitives
pub mod kernel;

// Lifecycle core
pub mod core;

// Isolation runtimes
pub mod runtime;

// Metadata persistence
pub mod store;

// Language adapters, validation and packages
pub mod install;
pub mod lang;
pub mod validate;

// Usage sampling
pub mod monitor;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the botbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use config::SupervisorConfig;
pub use core::{Actor, BotSupervisor, UploadReport};
