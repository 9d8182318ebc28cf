//! Metadata store
//!
//! A narrow read/write interface over users, bots, dependency records and
//! lifecycle log entries. No business logic lives here: the supervisor decides,
//! the store records. One store instance is created at process start and handed
//! to every component that needs it.

pub mod json_file;
pub mod memory;
pub mod state;

use crate::config::types::{
    BotId, BotRecord, BotState, DependencyRecord, LogEntry, Result, Severity, UserId, UserRecord,
};
use crate::lang::Language;
use std::path::Path;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;
pub use state::StoreState;

pub trait MetadataStore: Send + Sync {
    /// Create the user on first sight; refresh the username otherwise.
    fn upsert_user(&self, user_id: UserId, username: Option<&str>) -> Result<UserRecord>;
    fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>>;
    fn set_banned(&self, user_id: UserId, banned: bool) -> Result<()>;
    fn set_premium(&self, user_id: UserId, premium: bool) -> Result<()>;
    fn list_all_users(&self) -> Result<Vec<UserRecord>>;

    /// New bot in state `uploaded`; ids are never reused.
    fn create_bot(&self, user_id: UserId, name: &str, language: Language) -> Result<BotId>;
    fn get_bot(&self, bot_id: BotId) -> Result<Option<BotRecord>>;
    fn list_bots_for_user(&self, user_id: UserId) -> Result<Vec<BotRecord>>;
    fn list_all_bots(&self) -> Result<Vec<BotRecord>>;
    fn set_artifact(&self, bot_id: BotId, workspace: &Path, entry: &str, language: Language) -> Result<()>;
    /// `handle_ref` must be present exactly when `state` is running.
    fn update_status(&self, bot_id: BotId, state: BotState, handle_ref: Option<String>) -> Result<()>;
    fn record_usage(&self, bot_id: BotId, cpu_percent: f64, memory_mb: f64) -> Result<()>;
    /// Removes the bot with its dependency records and log entries.
    fn delete_bot(&self, bot_id: BotId) -> Result<()>;

    fn append_log(&self, bot_id: BotId, severity: Severity, message: &str) -> Result<()>;
    /// Most recent `limit` entries, oldest first.
    fn list_logs(&self, bot_id: BotId, limit: usize) -> Result<Vec<LogEntry>>;

    fn append_dependency(&self, bot_id: BotId, name: &str, version: &str) -> Result<()>;
    fn list_dependencies(&self, bot_id: BotId) -> Result<Vec<DependencyRecord>>;
}
