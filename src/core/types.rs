use crate::config::types::{BotId, BotState, UserId};
use crate::lang::Language;
use crate::validate::ValidationResult;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Who is asking. Admin rights come from configuration, never from the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub username: Option<String>,
}

impl Actor {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// Outcome of an upload or re-upload.
///
/// An upload whose source does not parse still creates the bot, in state
/// `uploaded`, so the owner can re-upload a fixed version.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub bot_id: BotId,
    pub state: BotState,
    pub language: Language,
    pub entry: String,
    pub workspace: PathBuf,
    pub validation: ValidationResult,
    /// Third-party packages the entry imports
    pub dependencies: BTreeSet<String>,
}
