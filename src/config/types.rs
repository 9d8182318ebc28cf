/// Core types and structures for the botbox system
use crate::lang::Language;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Bot identifier, assigned by the metadata store at creation.
pub type BotId = u64;

/// Chat-side user identifier.
pub type UserId = i64;

/// Lifecycle state of a hosted bot.
///
/// `Uploaded` is the initial state and is not runnable until the entry artifact
/// has passed validation. `Deleted` is terminal and never persisted: a deleted
/// bot simply has no record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Uploaded,
    Stopped,
    Running,
    Deleted,
}

impl BotState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity tag of a lifecycle log entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Single structured syntax diagnostic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxError {
    /// 1-based line, when the parser reported one
    pub line: Option<u32>,
    /// 1-based column, best effort
    pub column: Option<u32>,
    pub message: String,
}

impl SyntaxError {
    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self {
            line: None,
            column: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(col)) => write!(f, "line {}, column {}: {}", line, col, self.message),
            (Some(line), None) => write!(f, "line {}: {}", line, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Persistent description of one hosted bot.
///
/// Invariant: `handle_ref.is_some()` iff `state == BotState::Running`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BotRecord {
    pub bot_id: BotId,
    pub owner_id: UserId,
    pub name: String,
    pub language: Language,
    /// Workspace directory, set once the artifact has been stored
    pub workspace: Option<PathBuf>,
    /// Entry artifact file name, relative to the workspace
    pub entry: Option<String>,
    pub state: BotState,
    /// Opaque isolation-runtime reference; present only while running
    pub handle_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl BotRecord {
    pub fn entry_path(&self) -> Option<PathBuf> {
        match (&self.workspace, &self.entry) {
            (Some(ws), Some(entry)) => Some(ws.join(entry)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub is_banned: bool,
    pub is_premium: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub bot_id: BotId,
    pub name: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
}

/// Append-only lifecycle log entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub bot_id: BotId,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Error taxonomy for every supervisor operation.
///
/// Everything except [`BotError::Store`] is an expected, recoverable outcome.
#[derive(Error, Debug)]
pub enum BotError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed: {}", summarize_syntax_errors(.0))]
    ValidationFailed(Vec<SyntaxError>),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Infrastructure unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("Unsupported upload: {0}")]
    UnsupportedUpload(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metadata store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

fn summarize_syntax_errors(errors: &[SyntaxError]) -> String {
    match errors.first() {
        Some(first) if errors.len() > 1 => format!("{} (+{} more)", first, errors.len() - 1),
        Some(first) => first.to_string(),
        None => "no diagnostics".to_string(),
    }
}

impl BotError {
    /// Only a broken metadata store is treated as fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Stable machine-readable kind, used by the CLI and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidState(_) => "invalid_state",
            Self::ValidationFailed(_) => "validation_failed",
            Self::InstallFailed(_) => "install_failed",
            Self::LaunchFailed(_) => "launch_failed",
            Self::Timeout(_) => "timeout",
            Self::InfrastructureUnavailable(_) => "infrastructure_unavailable",
            Self::UnsupportedUpload(_) => "unsupported_upload",
            Self::Workspace(_) => "workspace",
            Self::Config(_) => "config",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
            Self::Lock(_) => "lock",
        }
    }

    /// Short reason suitable for an end user. Internal detail stays in the log.
    pub fn user_message(&self) -> String {
        const MAX_REASON: usize = 300;
        match self {
            Self::Store(_) | Self::Io(_) => "Internal error, please try again later".to_string(),
            Self::Lock(_) => "Bot is busy with another operation, try again shortly".to_string(),
            other => {
                let text = other.to_string();
                if text.chars().count() > MAX_REASON {
                    let cut: String = text.chars().take(MAX_REASON).collect();
                    format!("{}…", cut)
                } else {
                    text
                }
            }
        }
    }
}

/// Per-bot operation lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timeout waiting for bot {bot_id} after {waited:?}")]
    Timeout { bot_id: BotId, waited: Duration },

    #[error("Lock system error: {0}")]
    System(String),
}

impl From<std::io::Error> for LockError {
    fn from(e: std::io::Error) -> Self {
        LockError::System(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
pub type LockResult<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&BotState::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let back: BotState = serde_json::from_str("\"uploaded\"").unwrap();
        assert_eq!(back, BotState::Uploaded);
    }

    #[test]
    fn test_validation_error_message_uses_first_diagnostic() {
        let err = BotError::ValidationFailed(vec![
            SyntaxError {
                line: Some(3),
                column: Some(7),
                message: "'(' was never closed".to_string(),
            },
            SyntaxError::diagnostic("second"),
        ]);
        assert_eq!(
            err.to_string(),
            "Validation failed: line 3, column 7: '(' was never closed (+1 more)"
        );
        assert_eq!(err.kind(), "validation_failed");
    }

    #[test]
    fn test_only_store_errors_are_fatal() {
        assert!(BotError::Store("corrupt".into()).is_fatal());
        assert!(!BotError::LaunchFailed("no image".into()).is_fatal());
        assert!(!BotError::InvalidState("running".into()).is_fatal());
    }

    #[test]
    fn test_user_message_hides_internal_detail() {
        let err = BotError::Store("row 12 has malformed json at byte 88".into());
        assert!(!err.user_message().contains("byte 88"));

        let long = BotError::InstallFailed("x".repeat(1000));
        assert!(long.user_message().chars().count() <= 301);
    }
}
