//! Safety and cleanup
//!
//! Per-bot locking, workspace allocation and symlink-safe tree removal.

pub mod lock_manager;
pub mod safe_cleanup;
pub mod workspace;
