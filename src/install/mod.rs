//! Dependency installer
//!
//! Runs the language's package manager with the workspace as install target,
//! under a hard timeout. A failed or timed-out install leaves the workspace as
//! the installer left it; nothing is rolled back.

use crate::config::loader::SupervisorConfig;
use crate::config::types::{BotError, Result};
use crate::lang::adapter::requested_name;
use crate::lang::Language;
use crate::utils::output::{tail_lines, truncate_for_display};
use crate::utils::subprocess::{run_bounded, RunOptions};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Recorded when the installer does not reveal a version.
pub const UNKNOWN_VERSION: &str = "latest";

const MAX_NAME_LEN: usize = 214;
const DIAGNOSTIC_LINES: usize = 20;
const DIAGNOSTIC_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub package: String,
    pub version: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DependencyInstaller {
    package_managers: HashMap<Language, String>,
    timeout: Duration,
}

/// Reject names that would be read as options or escape the workspace.
pub fn check_package_name(package: &str) -> Result<()> {
    let reject = |why: &str| Err(BotError::InstallFailed(format!("refusing package {:?}: {}", package, why)));
    if package.is_empty() || package.len() > MAX_NAME_LEN {
        return reject("empty or too long");
    }
    if package.starts_with('-') {
        return reject("looks like an option");
    }
    if package.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return reject("contains whitespace or control characters");
    }
    if package.contains("..") || package.contains('\\') {
        return reject("contains a path");
    }
    let name = requested_name(package);
    let slashes = name.matches('/').count();
    let scoped = name.starts_with('@') && slashes == 1;
    if slashes > 0 && !scoped {
        return reject("contains a path");
    }
    // URLs and local archives are not packages.
    if package.contains("://") || package.starts_with('.') || package.starts_with('/') {
        return reject("not a registry package");
    }
    Ok(())
}

fn diagnostic(stdout: &str, stderr: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    truncate_for_display(tail_lines(source, DIAGNOSTIC_LINES).trim(), DIAGNOSTIC_CHARS)
}

impl DependencyInstaller {
    pub fn new(package_managers: HashMap<Language, String>, timeout: Duration) -> Self {
        Self {
            package_managers,
            timeout,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        let managers = Language::ALL
            .into_iter()
            .map(|lang| (lang, config.toolchain(lang).package_manager))
            .collect();
        Self::new(managers, config.install_timeout())
    }

    fn package_manager(&self, language: Language) -> String {
        self.package_managers
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.adapter().default_package_manager().to_string())
    }

    /// Install `package` into `workspace`.
    pub fn install(&self, workspace: &Path, language: Language, package: &str) -> Result<InstallReport> {
        check_package_name(package)?;
        if !workspace.is_dir() {
            return Err(BotError::Workspace(format!(
                "{} does not exist",
                workspace.display()
            )));
        }
        let adapter = language.adapter();
        let argv = adapter.install_command(&self.package_manager(language), workspace, package);

        let mut opts = RunOptions::with_timeout(self.timeout);
        opts.cwd = Some(workspace);
        opts.env.push(("PIP_NO_INPUT".to_string(), "1".to_string()));
        opts.env.push(("npm_config_yes".to_string(), "true".to_string()));
        let outcome = run_bounded(&argv, &opts)?;

        if outcome.timed_out {
            warn!("Install of {} timed out after {:?}", package, self.timeout);
            return Err(BotError::Timeout(format!(
                "installing {} exceeded {}s: {}",
                package,
                self.timeout.as_secs(),
                diagnostic(&outcome.stdout, &outcome.stderr)
            )));
        }
        if !outcome.success() {
            warn!("Install of {} failed: {}", package, outcome.describe_exit());
            return Err(BotError::InstallFailed(format!(
                "{} ({}): {}",
                package,
                outcome.describe_exit(),
                diagnostic(&outcome.stdout, &outcome.stderr)
            )));
        }

        let name = requested_name(package).to_string();
        let version = adapter
            .installed_version(workspace, package, &outcome.stdout)
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        info!(
            "Installed {} {} into {} in {:.1}s",
            name,
            version,
            workspace.display(),
            outcome.elapsed.as_secs_f64()
        );
        Ok(InstallReport {
            message: format!("Installed {} {}", name, version),
            package: name,
            version,
        })
    }
}
