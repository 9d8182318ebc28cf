use crate::config::types::SyntaxError;
use crate::lang::Language;
use std::collections::BTreeSet;
use std::path::Path;

/// How a language's own toolchain is asked to parse a candidate source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxCheck {
    /// Run `argv` and feed the source on stdin.
    Stdin { argv: Vec<String> },
    /// Write the source to a scratch file with `suffix`, then run `argv` followed by its path.
    ScratchFile { argv: Vec<String>, suffix: &'static str },
}

/// Raw output of a syntax-check run handed back to the adapter for interpretation.
#[derive(Debug, Clone, Default)]
pub struct CheckOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Language adapter contract: the one place that knows interpreter, parser,
/// import conventions and package manager for a language.
pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> Language;
    fn extension(&self) -> &'static str;
    fn default_interpreter(&self) -> &'static str;
    fn default_image(&self) -> &'static str;
    fn default_package_manager(&self) -> &'static str;

    /// Command that runs `entry` (a path relative to the working directory).
    fn run_command(&self, interpreter: &str, entry: &str) -> Vec<String>;

    fn syntax_check(&self, interpreter: &str) -> SyntaxCheck;

    /// Turn checker output into diagnostics. Empty means the source parsed.
    fn interpret_check(&self, output: &CheckOutput) -> Vec<SyntaxError>;

    /// Top-level third-party package names referenced by `source`. Never fails.
    fn extract_dependencies(&self, source: &str) -> BTreeSet<String>;

    /// Installer argv scoped to `workspace`.
    fn install_command(&self, tool: &str, workspace: &Path, package: &str) -> Vec<String>;

    /// Best-effort installed version after a successful install.
    fn installed_version(&self, workspace: &Path, package: &str, installer_stdout: &str)
        -> Option<String>;
}

/// Strip a version specifier (`pkg==1.0`, `pkg@^2`, `pkg>=3`) off a requested package.
pub fn requested_name(package: &str) -> &str {
    let scoped = package.starts_with('@');
    let search_from = if scoped { 1 } else { 0 };
    let end = package[search_from..]
        .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '@' | '[' | ';' | ' '))
        .map(|idx| idx + search_from)
        .unwrap_or(package.len());
    &package[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_name_strips_specifiers() {
        assert_eq!(requested_name("requests==2.31.0"), "requests");
        assert_eq!(requested_name("aiogram>=3"), "aiogram");
        assert_eq!(requested_name("uvicorn[standard]"), "uvicorn");
        assert_eq!(requested_name("lodash@^4.17.0"), "lodash");
        assert_eq!(requested_name("@discordjs/rest@2.0.0"), "@discordjs/rest");
        assert_eq!(requested_name("telegraf"), "telegraf");
    }
}
