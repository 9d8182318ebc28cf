use crate::config::loader::SupervisorConfig;
use crate::config::types::{BotError, BotId, UserId};
use crate::config::validator::validate_config;
use crate::core::{Actor, BotSupervisor};
use crate::lang::Language;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::debug;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Operation failed with an expected error.
const EXIT_FAILED: i32 = 1;
/// The metadata store is unusable.
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; used by the native runtime re-exec path)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    /// Instance served by the internal keeper role
    #[arg(long, hide = true)]
    instance: Option<String>,
    /// Configuration file (defaults to $BOTBOX_CONFIG, then ./botbox.config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Acting user id
    #[arg(long, global = true)]
    user: Option<UserId>,
    /// Display name recorded for the acting user
    #[arg(long, global = true)]
    username: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a script or zip archive as a new bot
    Upload {
        /// Path to a .py, .js or .zip file
        file: PathBuf,
    },
    /// Replace the artifact of a stopped bot
    Reupload {
        bot_id: BotId,
        file: PathBuf,
    },
    /// Launch a validated bot
    Start { bot_id: BotId },
    /// Stop a running bot
    Stop { bot_id: BotId },
    /// Stop then start a running bot
    Restart { bot_id: BotId },
    /// Stop if needed, then remove the bot and its workspace
    Delete { bot_id: BotId },
    /// Show the reconciled record of one bot
    Status { bot_id: BotId },
    /// List your bots (administrators may list every bot)
    List {
        #[arg(long)]
        all: bool,
    },
    /// Recent program output
    Logs {
        bot_id: BotId,
        /// Number of lines from the end
        #[arg(long)]
        lines: Option<usize>,
    },
    /// Sample CPU and memory usage of a running bot
    Stats { bot_id: BotId },
    /// Install a package into the bot's workspace
    Install { bot_id: BotId, package: String },
    /// Packages installed through `install`
    Deps { bot_id: BotId },
    /// Lifecycle log of a bot
    History {
        bot_id: BotId,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Parse-check a source file without storing anything
    Validate { file: PathBuf },
    /// Ban a user (administrators only)
    Ban { user_id: UserId },
    /// Lift a ban (administrators only)
    Unban { user_id: UserId },
    /// Grant or revoke the premium flag (administrators only)
    Premium {
        user_id: UserId,
        #[arg(long)]
        revoke: bool,
    },
    /// List known users (administrators only)
    Users,
    /// Prometheus text exposition of lifecycle metrics
    Metrics,
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Serialize)]
struct ErrorReport<'a> {
    error: &'a str,
    message: String,
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SupervisorConfig> {
    let config = match path {
        Some(path) => SupervisorConfig::load_from_file(path)?,
        None => SupervisorConfig::load_default()?,
    };
    validate_config(&config)?;
    Ok(config)
}

fn read_upload(file: &Path) -> Result<(String, Vec<u8>)> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid upload path {}", file.display()))?
        .to_string();
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    Ok((name, bytes))
}

/// Exit code for a failed operation, after reporting it on stdout.
fn report_failure(err: &BotError) -> i32 {
    let report = ErrorReport {
        error: err.kind(),
        message: err.user_message(),
    };
    if let Ok(text) = serde_json::to_string_pretty(&report) {
        println!("{}", text);
    }
    if err.is_fatal() {
        EXIT_FATAL
    } else {
        EXIT_FAILED
    }
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    if let Some(role) = cli.internal_role.as_deref() {
        if role == "keeper" {
            if cli.instance.is_none() {
                return Err(anyhow!("--instance is required for --internal-role=keeper"));
            }
            let code = crate::runtime::keeper::run_keeper()?;
            std::process::exit(code);
        }
        return Err(anyhow!("unsupported internal role: {}", role));
    }

    let command = cli.command.ok_or_else(|| anyhow!("missing command"))?;
    let config = load_config(cli.config.as_deref())?;

    // Commands that need neither an actor nor the store.
    match &command {
        Commands::ShowConfig => return emit_json(&config),
        Commands::Validate { file } => {
            let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("");
            let language = Language::from_extension(ext)
                .ok_or_else(|| anyhow!("cannot tell the language of {}", file.display()))?;
            let source = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let validator = crate::validate::StaticValidator::from_config(&config);
            let result = validator.validate(&source, language);
            emit_json(&result)?;
            if !result.valid {
                std::process::exit(EXIT_FAILED);
            }
            return Ok(());
        }
        _ => {}
    }

    let supervisor = BotSupervisor::from_config(config)?;
    debug!("Supervisor ready on the {} runtime", supervisor.runtime_name());

    if let Commands::Metrics = command {
        match supervisor.export_metrics() {
            Ok(text) => {
                print!("{}", text);
                return Ok(());
            }
            Err(e) => std::process::exit(report_failure(&e)),
        }
    }

    let user = cli
        .user
        .ok_or_else(|| anyhow!("--user is required for this command"))?;
    let mut actor = Actor::new(user);
    if let Some(name) = cli.username {
        actor = actor.with_username(name);
    }

    let outcome = dispatch(&supervisor, &actor, command)?;
    if let Err(e) = outcome {
        std::process::exit(report_failure(&e));
    }
    Ok(())
}

/// Outer error: local I/O or output failure. Inner error: the operation.
fn dispatch(
    supervisor: &BotSupervisor,
    actor: &Actor,
    command: Commands,
) -> Result<std::result::Result<(), BotError>> {
    macro_rules! json {
        ($op:expr) => {
            match $op {
                Ok(value) => emit_json(&value).map(Ok),
                Err(e) => Ok(Err(e)),
            }
        };
    }

    match command {
        Commands::Upload { file } => {
            let (name, bytes) = read_upload(&file)?;
            json!(supervisor.upload(actor, &name, &bytes))
        }
        Commands::Reupload { bot_id, file } => {
            let (name, bytes) = read_upload(&file)?;
            json!(supervisor.reupload(actor, bot_id, &name, &bytes))
        }
        Commands::Start { bot_id } => json!(supervisor.start(actor, bot_id)),
        Commands::Stop { bot_id } => json!(supervisor.stop(actor, bot_id)),
        Commands::Restart { bot_id } => json!(supervisor.restart(actor, bot_id)),
        Commands::Delete { bot_id } => json!(supervisor
            .delete(actor, bot_id)
            .map(|_| serde_json::json!({ "deleted": bot_id }))),
        Commands::Status { bot_id } => json!(supervisor.status(actor, bot_id)),
        Commands::List { all } => {
            if all {
                json!(supervisor.list_all_bots(actor))
            } else {
                json!(supervisor.list_bots(actor))
            }
        }
        Commands::Logs { bot_id, lines } => match supervisor.logs(actor, bot_id, lines) {
            Ok(text) => {
                print!("{}", text);
                Ok(Ok(()))
            }
            Err(e) => Ok(Err(e)),
        },
        Commands::Stats { bot_id } => json!(supervisor.stats(actor, bot_id)),
        Commands::Install { bot_id, package } => json!(supervisor.install(actor, bot_id, &package)),
        Commands::Deps { bot_id } => json!(supervisor.dependencies(actor, bot_id)),
        Commands::History { bot_id, limit } => json!(supervisor.history(actor, bot_id, limit)),
        Commands::Ban { user_id } => json!(supervisor
            .ban_user(actor, user_id)
            .map(|_| serde_json::json!({ "banned": user_id }))),
        Commands::Unban { user_id } => json!(supervisor
            .unban_user(actor, user_id)
            .map(|_| serde_json::json!({ "unbanned": user_id }))),
        Commands::Premium { user_id, revoke } => json!(supervisor
            .set_premium(actor, user_id, !revoke)
            .map(|_| serde_json::json!({ "user_id": user_id, "premium": !revoke }))),
        Commands::Users => json!(supervisor.list_users(actor)),
        Commands::Metrics | Commands::ShowConfig | Commands::Validate { .. } => {
            Err(anyhow!("command handled before dispatch"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_keeper_role_parses_without_subcommand() {
        let cli = Cli::try_parse_from([
            "botbox",
            "--internal-role",
            "keeper",
            "--instance",
            "bot-7",
        ])
        .unwrap();
        assert_eq!(cli.internal_role.as_deref(), Some("keeper"));
        assert_eq!(cli.instance.as_deref(), Some("bot-7"));
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_global_user_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["botbox", "start", "12", "--user", "42"]).unwrap();
        assert_eq!(cli.user, Some(42));
        assert!(matches!(cli.command, Some(Commands::Start { bot_id: 12 })));
    }

    #[test]
    fn test_failure_exit_codes() {
        assert_eq!(report_failure(&BotError::NotFound("bot 1".into())), EXIT_FAILED);
        assert_eq!(report_failure(&BotError::Store("corrupt".into())), EXIT_FATAL);
    }
}
