/// In-memory table of live execution handles, keyed by bot id
///
/// Handles are never persisted; the store only keeps the opaque reference. A
/// missing entry is resolved again through the runtime on demand.
use crate::config::types::BotId;
use crate::runtime::ExecutionContext;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct HandleTable {
    handles: Mutex<HashMap<BotId, Arc<dyn ExecutionContext>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<BotId, Arc<dyn ExecutionContext>>> {
        // A panic while holding the map cannot leave it half-updated.
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, bot_id: BotId) -> Option<Arc<dyn ExecutionContext>> {
        self.table().get(&bot_id).cloned()
    }

    /// Returns the handle previously registered for `bot_id`, if any.
    pub fn insert(&self, bot_id: BotId, handle: Arc<dyn ExecutionContext>) -> Option<Arc<dyn ExecutionContext>> {
        self.table().insert(bot_id, handle)
    }

    pub fn remove(&self, bot_id: BotId) -> Option<Arc<dyn ExecutionContext>> {
        self.table().remove(&bot_id)
    }
}
