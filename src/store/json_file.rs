/// JSON file store
///
/// Every call reloads the file under a flock on `<file>.lock`, so several
/// supervisor processes (one per CLI invocation, say) see each other's writes.
/// Writes go through [`atomic_write`]. A file that no longer parses is treated as
/// a fatal store fault rather than silently replaced.
use crate::config::types::{
    BotError, BotId, BotRecord, BotState, DependencyRecord, LogEntry, Result, Severity, UserId,
    UserRecord,
};
use crate::lang::Language;
use crate::safety::lock_manager::with_file_lock;
use crate::store::{MetadataStore, StoreState};
use crate::utils::atomic::atomic_write;
use log::error;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Opens (or prepares to create) the store and checks it parses.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                BotError::Store(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        store.view(|_| ())?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_state(&self) -> Result<StoreState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreState::default()),
            Err(e) => {
                error!("Metadata store {} unreadable: {}", self.path.display(), e);
                return Err(BotError::Store(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        if content.trim().is_empty() {
            return Ok(StoreState::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            error!(
                "Metadata store {} is corrupted at line {} column {}: {}",
                self.path.display(),
                e.line(),
                e.column(),
                e
            );
            BotError::Store(format!("{} is corrupted: {}", self.path.display(), e))
        })
    }

    fn write_state(&self, state: &StoreState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| BotError::Store(format!("cannot serialize store: {}", e)))?;
        atomic_write(&self.path, content.as_bytes()).map_err(|e| {
            error!("Metadata store {} write failed: {}", self.path.display(), e);
            BotError::Store(format!("cannot write {}: {}", self.path.display(), e))
        })
    }

    fn view<T>(&self, read: impl FnOnce(&StoreState) -> T) -> Result<T> {
        with_file_lock(&self.path, false, || {
            let state = self.read_state()?;
            Ok(read(&state))
        })
    }

    fn update<T>(&self, change: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        with_file_lock(&self.path, true, || {
            let mut state = self.read_state()?;
            let out = change(&mut state)?;
            self.write_state(&state)?;
            Ok(out)
        })
    }
}

impl MetadataStore for JsonFileStore {
    fn upsert_user(&self, user_id: UserId, username: Option<&str>) -> Result<UserRecord> {
        self.update(|s| Ok(s.upsert_user(user_id, username)))
    }

    fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        self.view(|s| s.get_user(user_id))
    }

    fn set_banned(&self, user_id: UserId, banned: bool) -> Result<()> {
        self.update(|s| {
            s.set_banned(user_id, banned);
            Ok(())
        })
    }

    fn set_premium(&self, user_id: UserId, premium: bool) -> Result<()> {
        self.update(|s| {
            s.set_premium(user_id, premium);
            Ok(())
        })
    }

    fn list_all_users(&self) -> Result<Vec<UserRecord>> {
        self.view(|s| s.list_all_users())
    }

    fn create_bot(&self, user_id: UserId, name: &str, language: Language) -> Result<BotId> {
        self.update(|s| Ok(s.create_bot(user_id, name, language)))
    }

    fn get_bot(&self, bot_id: BotId) -> Result<Option<BotRecord>> {
        self.view(|s| s.get_bot(bot_id))
    }

    fn list_bots_for_user(&self, user_id: UserId) -> Result<Vec<BotRecord>> {
        self.view(|s| s.list_bots_for_user(user_id))
    }

    fn list_all_bots(&self) -> Result<Vec<BotRecord>> {
        self.view(|s| s.list_all_bots())
    }

    fn set_artifact(&self, bot_id: BotId, workspace: &Path, entry: &str, language: Language) -> Result<()> {
        self.update(|s| s.set_artifact(bot_id, workspace, entry, language))
    }

    fn update_status(&self, bot_id: BotId, state: BotState, handle_ref: Option<String>) -> Result<()> {
        self.update(|s| s.update_status(bot_id, state, handle_ref))
    }

    fn record_usage(&self, bot_id: BotId, cpu_percent: f64, memory_mb: f64) -> Result<()> {
        self.update(|s| s.record_usage(bot_id, cpu_percent, memory_mb))
    }

    fn delete_bot(&self, bot_id: BotId) -> Result<()> {
        self.update(|s| s.delete_bot(bot_id))
    }

    fn append_log(&self, bot_id: BotId, severity: Severity, message: &str) -> Result<()> {
        self.update(|s| s.append_log(bot_id, severity, message))
    }

    fn list_logs(&self, bot_id: BotId, limit: usize) -> Result<Vec<LogEntry>> {
        self.view(|s| s.list_logs(bot_id, limit))
    }

    fn append_dependency(&self, bot_id: BotId, name: &str, version: &str) -> Result<()> {
        self.update(|s| s.append_dependency(bot_id, name, version))
    }

    fn list_dependencies(&self, bot_id: BotId) -> Result<Vec<DependencyRecord>> {
        self.view(|s| s.list_dependencies(bot_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botbox.json");

        let id = {
            let store = JsonFileStore::open(&path).unwrap();
            let id = store.create_bot(10, "echo", Language::Python).unwrap();
            store
                .set_artifact(id, Path::new("/srv/user_10/bot_1"), "bot.py", Language::Python)
                .unwrap();
            store.append_log(id, Severity::Info, "uploaded").unwrap();
            id
        };

        let store = JsonFileStore::open(&path).unwrap();
        let bot = store.get_bot(id).unwrap().unwrap();
        assert_eq!(bot.name, "echo");
        assert_eq!(bot.entry.as_deref(), Some("bot.py"));
        assert_eq!(store.list_logs(id, 10).unwrap().len(), 1);
        assert_eq!(store.list_bots_for_user(10).unwrap().len(), 1);
    }

    #[test]
    fn test_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botbox.json");
        fs::write(&path, "{\"next_bot_id\": 3, \"bots\": [oops").unwrap();

        let err = JsonFileStore::open(&path).unwrap_err();
        assert!(err.is_fatal());
        // The damaged file is left for inspection.
        assert!(fs::read_to_string(&path).unwrap().contains("oops"));
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botbox.json");
        let store = JsonFileStore::open(&path).unwrap();
        let id = store.create_bot(1, "busy", Language::Python).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store
                            .append_log(id, Severity::Info, &format!("t{} e{}", t, i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.list_logs(id, 100).unwrap().len(), 40);
    }
}
