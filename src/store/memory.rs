/// In-process store, used by tests and embedders that persist elsewhere
use crate::config::types::{
    BotError, BotId, BotRecord, BotState, DependencyRecord, LogEntry, Result, Severity, UserId,
    UserRecord,
};
use crate::lang::Language;
use crate::store::{MetadataStore, StoreState};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| BotError::Store("in-memory store poisoned by a panicked writer".to_string()))
    }

    pub fn snapshot(&self) -> Result<StoreState> {
        Ok(self.state()?.clone())
    }
}

impl MetadataStore for MemoryStore {
    fn upsert_user(&self, user_id: UserId, username: Option<&str>) -> Result<UserRecord> {
        Ok(self.state()?.upsert_user(user_id, username))
    }

    fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        Ok(self.state()?.get_user(user_id))
    }

    fn set_banned(&self, user_id: UserId, banned: bool) -> Result<()> {
        self.state()?.set_banned(user_id, banned);
        Ok(())
    }

    fn set_premium(&self, user_id: UserId, premium: bool) -> Result<()> {
        self.state()?.set_premium(user_id, premium);
        Ok(())
    }

    fn list_all_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.state()?.list_all_users())
    }

    fn create_bot(&self, user_id: UserId, name: &str, language: Language) -> Result<BotId> {
        Ok(self.state()?.create_bot(user_id, name, language))
    }

    fn get_bot(&self, bot_id: BotId) -> Result<Option<BotRecord>> {
        Ok(self.state()?.get_bot(bot_id))
    }

    fn list_bots_for_user(&self, user_id: UserId) -> Result<Vec<BotRecord>> {
        Ok(self.state()?.list_bots_for_user(user_id))
    }

    fn list_all_bots(&self) -> Result<Vec<BotRecord>> {
        Ok(self.state()?.list_all_bots())
    }

    fn set_artifact(&self, bot_id: BotId, workspace: &Path, entry: &str, language: Language) -> Result<()> {
        self.state()?.set_artifact(bot_id, workspace, entry, language)
    }

    fn update_status(&self, bot_id: BotId, state: BotState, handle_ref: Option<String>) -> Result<()> {
        self.state()?.update_status(bot_id, state, handle_ref)
    }

    fn record_usage(&self, bot_id: BotId, cpu_percent: f64, memory_mb: f64) -> Result<()> {
        self.state()?.record_usage(bot_id, cpu_percent, memory_mb)
    }

    fn delete_bot(&self, bot_id: BotId) -> Result<()> {
        self.state()?.delete_bot(bot_id)
    }

    fn append_log(&self, bot_id: BotId, severity: Severity, message: &str) -> Result<()> {
        self.state()?.append_log(bot_id, severity, message)
    }

    fn list_logs(&self, bot_id: BotId, limit: usize) -> Result<Vec<LogEntry>> {
        Ok(self.state()?.list_logs(bot_id, limit))
    }

    fn append_dependency(&self, bot_id: BotId, name: &str, version: &str) -> Result<()> {
        self.state()?.append_dependency(bot_id, name, version)
    }

    fn list_dependencies(&self, bot_id: BotId) -> Result<Vec<DependencyRecord>> {
        Ok(self.state()?.list_dependencies(bot_id))
    }
}
