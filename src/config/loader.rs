/// Supervisor configuration loaded from JSON
use crate::config::types::{BotError, Result, UserId};
use crate::kernel::cgroup::backend::CGROUP_V2_MOUNT;
use crate::lang::Language;
use crate::safety::workspace::WorkspaceLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "BOTBOX_CONFIG";

/// Searched when the environment variable is unset.
pub const DEFAULT_CONFIG_FILE: &str = "botbox.config.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Local processes under a keeper, limited through cgroup v2
    Native,
    /// Containers driven through the docker CLI
    Docker,
}

/// Per-language overrides
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageSettings {
    pub interpreter: Option<String>,
    pub image: Option<String>,
    pub package_manager: Option<String>,
}

/// Resolved commands for one language
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toolchain {
    pub interpreter: String,
    pub image: String,
    pub package_manager: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub root_dir: PathBuf,
    pub store_path: PathBuf,
    pub runtime: RuntimeKind,

    pub memory_limit_mb: u64,
    /// Fraction of one core
    pub cpu_share: f64,
    pub process_limit: u32,

    pub stop_grace_ms: u64,
    pub restart_delay_ms: u64,
    pub install_timeout_secs: u64,
    pub validate_timeout_secs: u64,
    pub sample_window_ms: u64,
    pub lock_timeout_secs: u64,

    pub log_tail_lines: usize,
    pub log_display_chars: usize,
    pub history_limit: usize,

    pub max_upload_bytes: u64,
    pub max_archive_entries: usize,
    pub max_extracted_bytes: u64,

    pub admin_ids: Vec<UserId>,
    pub cgroup_root: PathBuf,
    pub docker_binary: String,

    pub python: LanguageSettings,
    pub javascript: LanguageSettings,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./hosted_bots"),
            store_path: PathBuf::from("./botbox.json"),
            runtime: RuntimeKind::Native,
            memory_limit_mb: 512,
            cpu_share: 0.5,
            process_limit: 64,
            stop_grace_ms: 5_000,
            restart_delay_ms: 2_000,
            install_timeout_secs: 60,
            validate_timeout_secs: 5,
            sample_window_ms: 500,
            lock_timeout_secs: 120,
            log_tail_lines: 50,
            log_display_chars: 4_000,
            history_limit: 20,
            max_upload_bytes: 10 * 1024 * 1024,
            max_archive_entries: 512,
            max_extracted_bytes: 50 * 1024 * 1024,
            admin_ids: Vec::new(),
            cgroup_root: Path::new(CGROUP_V2_MOUNT).join("botbox"),
            docker_binary: "docker".to_string(),
            python: LanguageSettings::default(),
            javascript: LanguageSettings::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BotError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BotError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    /// `$BOTBOX_CONFIG`, else `./botbox.config.json`, else built-in defaults.
    pub fn load_default() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from_file(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load_from_file(local);
        }
        log::debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn language_settings(&self, language: Language) -> &LanguageSettings {
        match language {
            Language::Python => &self.python,
            Language::JavaScript => &self.javascript,
        }
    }

    pub fn toolchain(&self, language: Language) -> Toolchain {
        let adapter = language.adapter();
        let settings = self.language_settings(language);
        let interpreter = settings
            .interpreter
            .clone()
            .unwrap_or_else(|| adapter.default_interpreter().to_string());
        let package_manager = settings.package_manager.clone().unwrap_or_else(|| {
            // pip runs through the configured interpreter.
            match language {
                Language::Python => interpreter.clone(),
                Language::JavaScript => adapter.default_package_manager().to_string(),
            }
        });
        Toolchain {
            interpreter,
            image: settings
                .image
                .clone()
                .unwrap_or_else(|| adapter.default_image().to_string()),
            package_manager,
        }
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.admin_ids.contains(&user_id)
    }

    pub fn workspace_limits(&self) -> WorkspaceLimits {
        WorkspaceLimits {
            max_upload_bytes: self.max_upload_bytes,
            max_archive_entries: self.max_archive_entries,
            max_extracted_bytes: self.max_extracted_bytes,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_secs)
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_millis(self.sample_window_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_hosting_limits() {
        let config = SupervisorConfig::default();
        assert_eq!(config.memory_limit_mb, 512);
        assert_eq!(config.memory_limit_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.cpu_share, 0.5);
        assert_eq!(config.install_timeout(), Duration::from_secs(60));
        assert_eq!(config.restart_delay(), Duration::from_secs(2));
        assert_eq!(config.runtime, RuntimeKind::Native);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"memory_limit_mb": 256, "runtime": "docker", "admin_ids": [1, 2],
                "python": {"interpreter": "/usr/bin/python3.12"}}"#,
        )
        .unwrap();

        let config = SupervisorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.memory_limit_mb, 256);
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert!(config.is_admin(2));
        assert!(!config.is_admin(3));
        assert_eq!(config.log_tail_lines, 50);

        let py = config.toolchain(Language::Python);
        assert_eq!(py.interpreter, "/usr/bin/python3.12");
        assert_eq!(py.package_manager, "/usr/bin/python3.12");
        assert_eq!(py.image, "python:3.11-slim");

        let js = config.toolchain(Language::JavaScript);
        assert_eq!(js.interpreter, "node");
        assert_eq!(js.package_manager, "npm");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"{not json").unwrap();
        assert!(matches!(
            SupervisorConfig::load_from_file(file.path()),
            Err(BotError::Config(_))
        ));
    }
}
