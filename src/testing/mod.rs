//! Testing infrastructure
//!
//! Hermetic stand-ins for the isolation runtime and the workspace allocator,
//! plus a configuration that never touches real interpreters.

pub mod scripted;

pub use scripted::{ScriptedContext, ScriptedRuntime};

use crate::config::loader::SupervisorConfig;
use crate::config::types::{BotError, BotId, Result, UserId};
use crate::safety::workspace::{FsWorkspaceAllocator, StagedUpload, WorkspaceAllocator};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Configuration rooted under `root` with fast timings.
///
/// Both syntax checkers are `true`, so every upload validates without an
/// interpreter on the host.
pub fn test_config(root: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig {
        root_dir: root.join("bots"),
        store_path: root.join("botbox.json"),
        stop_grace_ms: 50,
        restart_delay_ms: 10,
        sample_window_ms: 10,
        lock_timeout_secs: 5,
        install_timeout_secs: 10,
        ..SupervisorConfig::default()
    };
    config.python.interpreter = Some("true".to_string());
    config.javascript.interpreter = Some("true".to_string());
    config
}

/// Filesystem allocator whose `destroy` can be made to fail.
pub struct FlakyWorkspaces {
    inner: FsWorkspaceAllocator,
    fail_destroy: AtomicBool,
}

impl FlakyWorkspaces {
    pub fn new(config: &SupervisorConfig) -> Result<Self> {
        Ok(Self {
            inner: FsWorkspaceAllocator::new(&config.root_dir, config.workspace_limits())?,
            fail_destroy: AtomicBool::new(false),
        })
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }
}

impl WorkspaceAllocator for FlakyWorkspaces {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn path_for(&self, user_id: UserId, bot_id: BotId) -> PathBuf {
        self.inner.path_for(user_id, bot_id)
    }

    fn stage(&self, filename: &str, bytes: &[u8]) -> Result<StagedUpload> {
        self.inner.stage(filename, bytes)
    }

    fn commit(&self, user_id: UserId, bot_id: BotId, staged: StagedUpload) -> Result<PathBuf> {
        self.inner.commit(user_id, bot_id, staged)
    }

    fn destroy(&self, user_id: UserId, bot_id: BotId) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(BotError::Workspace(format!(
                "simulated removal failure for {}",
                self.path_for(user_id, bot_id).display()
            )));
        }
        self.inner.destroy(user_id, bot_id)
    }
}
