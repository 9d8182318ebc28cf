/// Serializable store contents and the record-keeping shared by every backend
use crate::config::types::{
    BotError, BotId, BotRecord, BotState, DependencyRecord, LogEntry, Result, Severity, UserId,
    UserRecord,
};
use crate::lang::Language;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreState {
    next_bot_id: BotId,
    #[serde(default)]
    users: BTreeMap<UserId, UserRecord>,
    #[serde(default)]
    bots: BTreeMap<BotId, BotRecord>,
    #[serde(default)]
    dependencies: Vec<DependencyRecord>,
    #[serde(default)]
    logs: Vec<LogEntry>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            next_bot_id: 1,
            users: BTreeMap::new(),
            bots: BTreeMap::new(),
            dependencies: Vec::new(),
            logs: Vec::new(),
        }
    }
}

fn bot_missing(bot_id: BotId) -> BotError {
    BotError::NotFound(format!("bot {}", bot_id))
}

impl StoreState {
    fn bot_mut(&mut self, bot_id: BotId) -> Result<&mut BotRecord> {
        self.bots.get_mut(&bot_id).ok_or_else(|| bot_missing(bot_id))
    }

    fn user_entry(&mut self, user_id: UserId) -> &mut UserRecord {
        self.users.entry(user_id).or_insert_with(|| UserRecord {
            user_id,
            username: None,
            joined_at: Utc::now(),
            is_banned: false,
            is_premium: false,
        })
    }

    pub fn upsert_user(&mut self, user_id: UserId, username: Option<&str>) -> UserRecord {
        let user = self.user_entry(user_id);
        if let Some(name) = username {
            user.username = Some(name.to_string());
        }
        user.clone()
    }

    pub fn get_user(&self, user_id: UserId) -> Option<UserRecord> {
        self.users.get(&user_id).cloned()
    }

    pub fn set_banned(&mut self, user_id: UserId, banned: bool) {
        self.user_entry(user_id).is_banned = banned;
    }

    pub fn set_premium(&mut self, user_id: UserId, premium: bool) {
        self.user_entry(user_id).is_premium = premium;
    }

    pub fn list_all_users(&self) -> Vec<UserRecord> {
        self.users.values().cloned().collect()
    }

    pub fn create_bot(&mut self, user_id: UserId, name: &str, language: Language) -> BotId {
        self.user_entry(user_id);
        let bot_id = self.next_bot_id;
        self.next_bot_id += 1;
        self.bots.insert(
            bot_id,
            BotRecord {
                bot_id,
                owner_id: user_id,
                name: name.to_string(),
                language,
                workspace: None,
                entry: None,
                state: BotState::Uploaded,
                handle_ref: None,
                created_at: Utc::now(),
                last_active: None,
                cpu_percent: 0.0,
                memory_mb: 0.0,
            },
        );
        bot_id
    }

    pub fn get_bot(&self, bot_id: BotId) -> Option<BotRecord> {
        self.bots.get(&bot_id).cloned()
    }

    pub fn list_bots_for_user(&self, user_id: UserId) -> Vec<BotRecord> {
        self.bots
            .values()
            .filter(|b| b.owner_id == user_id)
            .cloned()
            .collect()
    }

    pub fn list_all_bots(&self) -> Vec<BotRecord> {
        self.bots.values().cloned().collect()
    }

    pub fn set_artifact(&mut self, bot_id: BotId, workspace: &Path, entry: &str, language: Language) -> Result<()> {
        let bot = self.bot_mut(bot_id)?;
        bot.workspace = Some(workspace.to_path_buf());
        bot.entry = Some(entry.to_string());
        bot.language = language;
        Ok(())
    }

    pub fn update_status(&mut self, bot_id: BotId, state: BotState, handle_ref: Option<String>) -> Result<()> {
        if (state == BotState::Running) != handle_ref.is_some() {
            return Err(BotError::InvalidState(format!(
                "bot {}: a handle reference is required exactly when running (state {}, handle {:?})",
                bot_id, state, handle_ref
            )));
        }
        if state == BotState::Deleted {
            return Err(BotError::InvalidState(
                "deleted bots are removed, not stored".to_string(),
            ));
        }
        let bot = self.bot_mut(bot_id)?;
        if bot.state != state {
            bot.last_active = Some(Utc::now());
        }
        bot.state = state;
        bot.handle_ref = handle_ref;
        Ok(())
    }

    pub fn record_usage(&mut self, bot_id: BotId, cpu_percent: f64, memory_mb: f64) -> Result<()> {
        let bot = self.bot_mut(bot_id)?;
        bot.cpu_percent = cpu_percent;
        bot.memory_mb = memory_mb;
        bot.last_active = Some(Utc::now());
        Ok(())
    }

    pub fn delete_bot(&mut self, bot_id: BotId) -> Result<()> {
        self.bots.remove(&bot_id).ok_or_else(|| bot_missing(bot_id))?;
        self.dependencies.retain(|d| d.bot_id != bot_id);
        self.logs.retain(|l| l.bot_id != bot_id);
        Ok(())
    }

    pub fn append_log(&mut self, bot_id: BotId, severity: Severity, message: &str) -> Result<()> {
        if !self.bots.contains_key(&bot_id) {
            return Err(bot_missing(bot_id));
        }
        self.logs.push(LogEntry {
            bot_id,
            severity,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn list_logs(&self, bot_id: BotId, limit: usize) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self
            .logs
            .iter()
            .filter(|l| l.bot_id == bot_id)
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order.
        entries.sort_by_key(|l| l.timestamp);
        let skip = entries.len().saturating_sub(limit);
        entries.split_off(skip)
    }

    pub fn append_dependency(&mut self, bot_id: BotId, name: &str, version: &str) -> Result<()> {
        if !self.bots.contains_key(&bot_id) {
            return Err(bot_missing(bot_id));
        }
        self.dependencies.push(DependencyRecord {
            bot_id,
            name: name.to_string(),
            version: version.to_string(),
            installed_at: Utc::now(),
        });
        Ok(())
    }

    pub fn list_dependencies(&self, bot_id: BotId) -> Vec<DependencyRecord> {
        self.dependencies
            .iter()
            .filter(|d| d.bot_id == bot_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_never_reused() {
        let mut state = StoreState::default();
        let a = state.create_bot(1, "a", Language::Python);
        state.delete_bot(a).unwrap();
        let b = state.create_bot(1, "b", Language::Python);
        assert_ne!(a, b);
    }

    #[test]
    fn test_running_requires_handle() {
        let mut state = StoreState::default();
        let id = state.create_bot(1, "a", Language::Python);
        assert!(state.update_status(id, BotState::Running, None).is_err());
        assert!(state
            .update_status(id, BotState::Stopped, Some("native:x".into()))
            .is_err());
        state
            .update_status(id, BotState::Running, Some("native:x".into()))
            .unwrap();
        let bot = state.get_bot(id).unwrap();
        assert_eq!(bot.state, BotState::Running);
        assert!(bot.last_active.is_some());
    }

    #[test]
    fn test_delete_cascades() {
        let mut state = StoreState::default();
        let keep = state.create_bot(1, "keep", Language::Python);
        let gone = state.create_bot(1, "gone", Language::JavaScript);
        state.append_log(gone, Severity::Info, "started").unwrap();
        state.append_dependency(gone, "telegraf", "4.15.3").unwrap();
        state.append_log(keep, Severity::Info, "started").unwrap();

        state.delete_bot(gone).unwrap();
        assert!(state.get_bot(gone).is_none());
        assert!(state.list_logs(gone, 10).is_empty());
        assert!(state.list_dependencies(gone).is_empty());
        assert_eq!(state.list_logs(keep, 10).len(), 1);
        assert!(matches!(state.delete_bot(gone), Err(BotError::NotFound(_))));
    }

    #[test]
    fn test_list_logs_keeps_most_recent() {
        let mut state = StoreState::default();
        let id = state.create_bot(1, "a", Language::Python);
        for i in 0..5 {
            state.append_log(id, Severity::Info, &format!("event {}", i)).unwrap();
        }
        let recent: Vec<String> = state.list_logs(id, 2).into_iter().map(|l| l.message).collect();
        assert_eq!(recent, vec!["event 3", "event 4"]);
    }

    #[test]
    fn test_ban_creates_user_on_demand() {
        let mut state = StoreState::default();
        state.set_banned(99, true);
        assert!(state.get_user(99).unwrap().is_banned);
        state.upsert_user(99, Some("mallory"));
        let user = state.get_user(99).unwrap();
        assert!(user.is_banned);
        assert_eq!(user.username.as_deref(), Some("mallory"));
    }
}
