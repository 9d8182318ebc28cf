//! Static validator: parse-only syntax checking and dependency extraction.
//!
//! The candidate program is never executed. Parsing is delegated to the
//! language's own toolchain in a bounded subprocess; any scratch file lives in a
//! [`tempfile::NamedTempFile`] that is removed when the check returns, whatever
//! the outcome.

use crate::config::loader::SupervisorConfig;
use crate::config::types::SyntaxError;
use crate::lang::adapter::{CheckOutput, SyntaxCheck};
use crate::lang::Language;
use crate::utils::output::OutputLimits;
use crate::utils::subprocess::{run_bounded, RunOptions};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<SyntaxError>,
    /// The check itself ran out of time
    pub timed_out: bool,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            timed_out: false,
        }
    }

    fn diagnostic(message: String) -> Self {
        Self {
            valid: false,
            errors: vec![SyntaxError::diagnostic(message)],
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaticValidator {
    interpreters: HashMap<Language, String>,
    timeout: Duration,
}

impl StaticValidator {
    pub fn new(interpreters: HashMap<Language, String>, timeout: Duration) -> Self {
        Self {
            interpreters,
            timeout,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        let interpreters = Language::ALL
            .into_iter()
            .map(|lang| (lang, config.toolchain(lang).interpreter))
            .collect();
        Self::new(interpreters, config.validate_timeout())
    }

    fn interpreter(&self, language: Language) -> String {
        self.interpreters
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.adapter().default_interpreter().to_string())
    }

    /// Parse `source` with the grammar of `language`.
    ///
    /// Infrastructure problems (missing interpreter, scratch file failure) come
    /// back as `valid = false` with a single diagnostic, never as an error.
    pub fn validate(&self, source: &str, language: Language) -> ValidationResult {
        let adapter = language.adapter();
        let check = adapter.syntax_check(&self.interpreter(language));
        let limits = OutputLimits {
            stdout_limit: 64 * 1024,
            stderr_limit: 64 * 1024,
        };

        let outcome = match check {
            SyntaxCheck::Stdin { argv } => {
                let opts = RunOptions {
                    stdin: Some(source.as_bytes()),
                    limits,
                    ..RunOptions::with_timeout(self.timeout)
                };
                run_bounded(&argv, &opts)
            }
            SyntaxCheck::ScratchFile { mut argv, suffix } => {
                let mut scratch = match tempfile::Builder::new()
                    .prefix("botbox-check-")
                    .suffix(suffix)
                    .tempfile()
                {
                    Ok(f) => f,
                    Err(e) => {
                        return ValidationResult::diagnostic(format!(
                            "validator unavailable: cannot create scratch file: {}",
                            e
                        ))
                    }
                };
                if let Err(e) = scratch.write_all(source.as_bytes()).and_then(|_| scratch.flush()) {
                    return ValidationResult::diagnostic(format!(
                        "validator unavailable: cannot write scratch file: {}",
                        e
                    ));
                }
                argv.push(scratch.path().to_string_lossy().to_string());
                let opts = RunOptions {
                    limits,
                    ..RunOptions::with_timeout(self.timeout)
                };
                run_bounded(&argv, &opts)
                // `scratch` is removed here on every path.
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("{} syntax check could not run: {}", language, e);
                return ValidationResult::diagnostic(format!("validator unavailable: {}", e));
            }
        };

        if outcome.timed_out {
            log::warn!("{} syntax check timed out after {:?}", language, self.timeout);
            return ValidationResult {
                timed_out: true,
                ..ValidationResult::diagnostic(format!(
                    "validation timed out after {}s",
                    self.timeout.as_secs_f64()
                ))
            };
        }

        let errors = adapter.interpret_check(&CheckOutput {
            exit_code: outcome.exit_code(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        });
        if errors.is_empty() {
            ValidationResult::ok()
        } else {
            ValidationResult {
                valid: false,
                errors,
                timed_out: false,
            }
        }
    }
}

/// Third-party package names imported by `source`. Best effort, never fails.
pub fn extract_dependencies(source: &str, language: Language) -> BTreeSet<String> {
    language.adapter().extract_dependencies(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_dependencies_dispatches_by_language() {
        let py = extract_dependencies("import os\nimport requests\nfrom os import path", Language::Python);
        assert_eq!(py.into_iter().collect::<Vec<_>>(), vec!["requests"]);

        let js = extract_dependencies("const t = require('telegraf')", Language::JavaScript);
        assert_eq!(js.into_iter().collect::<Vec<_>>(), vec!["telegraf"]);
    }

    #[test]
    fn test_missing_interpreter_is_a_diagnostic_not_an_error() {
        let validator = StaticValidator::new(
            HashMap::from([(Language::Python, "no-such-python-xyz".to_string())]),
            Duration::from_secs(2),
        );
        let result = validator.validate("print('hi')", Language::Python);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("validator unavailable"));
        assert!(!result.timed_out);
    }

    #[test]
    fn test_scratch_files_do_not_leak_when_checker_is_missing() {
        let before = count_scratch_files();
        let validator = StaticValidator::new(
            HashMap::from([(Language::JavaScript, "no-such-node-xyz".to_string())]),
            Duration::from_secs(2),
        );
        let result = validator.validate("let x = 1;", Language::JavaScript);
        assert!(!result.valid);
        assert!(count_scratch_files() <= before);
    }

    fn count_scratch_files() -> usize {
        std::fs::read_dir(std::env::temp_dir())
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with("botbox-check-"))
                    .count()
            })
            .unwrap_or(0)
    }
}
