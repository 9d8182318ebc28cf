// Startup configuration validation
// Fail fast with actionable errors; questionable values become warnings.

use crate::config::loader::{RuntimeKind, SupervisorConfig};
use crate::config::types::{BotError, Result};
use crate::kernel::procfs;
use crate::lang::Language;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate config at startup. Errors are fatal; warnings are logged.
pub fn validate_config(config: &SupervisorConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::default();

    validate_limits(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_toolchains(config, &mut result);
    validate_paths(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(BotError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }
    Ok(result)
}

fn validate_limits(config: &SupervisorConfig, result: &mut ValidationResult) {
    if config.memory_limit_mb == 0 {
        result.add_error("memory_limit_mb cannot be zero".to_string());
    } else if config.memory_limit_mb < 32 {
        result.add_warning(format!(
            "memory_limit_mb {} is very low, interpreters may not start",
            config.memory_limit_mb
        ));
    }

    let cores = procfs::online_cpus() as f64;
    if !(config.cpu_share > 0.0) {
        result.add_error(format!("cpu_share must be positive, got {}", config.cpu_share));
    } else if config.cpu_share > cores {
        result.add_error(format!(
            "cpu_share {} exceeds the {} online cores",
            config.cpu_share, cores
        ));
    } else if config.cpu_share < 0.05 {
        result.add_warning(format!("cpu_share {} is very low", config.cpu_share));
    }

    if config.process_limit == 0 {
        result.add_error("process_limit cannot be zero".to_string());
    } else if config.process_limit < 8 {
        result.add_warning(format!(
            "process_limit {} leaves little room for interpreter helper threads",
            config.process_limit
        ));
    }

    if config.max_upload_bytes == 0 || config.max_extracted_bytes == 0 {
        result.add_error("upload size limits cannot be zero".to_string());
    }
    if config.max_archive_entries == 0 {
        result.add_error("max_archive_entries cannot be zero".to_string());
    }
    if config.log_display_chars == 0 {
        result.add_warning("log_display_chars is zero, logs will always be empty".to_string());
    }
}

fn validate_timeouts(config: &SupervisorConfig, result: &mut ValidationResult) {
    if config.validate_timeout_secs == 0 {
        result.add_error("validate_timeout_secs cannot be zero".to_string());
    }
    if config.install_timeout_secs == 0 {
        result.add_error("install_timeout_secs cannot be zero".to_string());
    }
    if config.lock_timeout_secs == 0 {
        result.add_error("lock_timeout_secs cannot be zero".to_string());
    }
    if config.sample_window_ms == 0 {
        result.add_error("sample_window_ms cannot be zero".to_string());
    } else if config.sample_window_ms > 5_000 {
        result.add_warning(format!(
            "sample_window_ms {} makes stats slow to answer",
            config.sample_window_ms
        ));
    }
    // Locks must outlive the longest operation they guard.
    let longest = config
        .install_timeout_secs
        .max(config.stop_grace_ms / 1000 + config.restart_delay_ms / 1000);
    if config.lock_timeout_secs < longest {
        result.add_warning(format!(
            "lock_timeout_secs {} is shorter than the longest operation ({}s)",
            config.lock_timeout_secs, longest
        ));
    }
}

fn validate_toolchains(config: &SupervisorConfig, result: &mut ValidationResult) {
    for language in Language::ALL {
        let toolchain = config.toolchain(language);
        if toolchain.interpreter.trim().is_empty() {
            result.add_error(format!("{} interpreter cannot be empty", language));
        }
        if toolchain.package_manager.trim().is_empty() {
            result.add_error(format!("{} package manager cannot be empty", language));
        }
        if config.runtime == RuntimeKind::Docker && toolchain.image.trim().is_empty() {
            result.add_error(format!("{} image cannot be empty with the docker runtime", language));
        }
    }
    if config.runtime == RuntimeKind::Docker && config.docker_binary.trim().is_empty() {
        result.add_error("docker_binary cannot be empty".to_string());
    }
}

fn validate_paths(config: &SupervisorConfig, result: &mut ValidationResult) {
    if config.root_dir.as_os_str().is_empty() {
        result.add_error("root_dir cannot be empty".to_string());
    } else if config.root_dir.is_relative() {
        result.add_warning(format!(
            "root_dir {} is relative and depends on the working directory",
            config.root_dir.display()
        ));
    }
    if config.store_path.as_os_str().is_empty() {
        result.add_error("store_path cannot be empty".to_string());
    }
    if config.store_path.starts_with(&config.root_dir) {
        result.add_error(format!(
            "store_path {} must not live inside root_dir",
            config.store_path.display()
        ));
    }
    if !config.cgroup_root.is_absolute() {
        result.add_error(format!(
            "cgroup_root must be an absolute path: {}",
            config.cgroup_root.display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_are_valid() {
        let result = validate_config(&SupervisorConfig::default()).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_zero_memory_is_rejected() {
        let config = SupervisorConfig {
            memory_limit_mb: 0,
            ..SupervisorConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("memory_limit_mb"));
    }

    #[test]
    fn test_cpu_share_bounds() {
        let negative = SupervisorConfig {
            cpu_share: -1.0,
            ..SupervisorConfig::default()
        };
        assert!(validate_config(&negative).is_err());

        let huge = SupervisorConfig {
            cpu_share: 100_000.0,
            ..SupervisorConfig::default()
        };
        assert!(validate_config(&huge).is_err());
    }

    #[test]
    fn test_store_inside_root_is_rejected() {
        let config = SupervisorConfig {
            root_dir: PathBuf::from("/srv/bots"),
            store_path: PathBuf::from("/srv/bots/meta.json"),
            ..SupervisorConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_low_limits_only_warn() {
        let config = SupervisorConfig {
            memory_limit_mb: 16,
            process_limit: 4,
            ..SupervisorConfig::default()
        };
        let result = validate_config(&config).unwrap();
        assert!(result.warnings.len() >= 2);
    }
}
