use crate::config::types::SyntaxError;
use crate::lang::adapter::{requested_name, CheckOutput, LanguageAdapter, SyntaxCheck};
use crate::lang::Language;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct JavaScriptAdapter;

static REQUIRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("static regex"));
static IMPORT_FROM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bimport\s+(?:[\w*{}\s,$]+\s+from\s+)?['"]([^'"]+)['"]"#).expect("static regex")
});
static DYNAMIC_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bimport\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("static regex"));
static LOCATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":(\d+)\s*$").expect("static regex"));

/// Node core modules.
const BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "cluster", "console", "constants",
    "crypto", "dgram", "diagnostics_channel", "dns", "domain", "events", "fs", "http", "http2",
    "https", "inspector", "module", "net", "os", "path", "perf_hooks", "process", "punycode",
    "querystring", "readline", "repl", "stream", "string_decoder", "sys", "timers", "tls",
    "trace_events", "tty", "url", "util", "v8", "vm", "wasi", "worker_threads", "zlib",
];

/// Reduce a module specifier to its installable package name.
fn package_of(specifier: &str) -> Option<String> {
    let spec = specifier.trim();
    if spec.is_empty() || spec.starts_with('.') || spec.starts_with('/') || spec.starts_with("node:") {
        return None;
    }
    let mut parts = spec.split('/');
    let first = parts.next()?;
    let name = if first.starts_with('@') {
        format!("{}/{}", first, parts.next()?)
    } else {
        first.to_string()
    };
    if BUILTINS.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

impl LanguageAdapter for JavaScriptAdapter {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn extension(&self) -> &'static str {
        "js"
    }

    fn default_interpreter(&self) -> &'static str {
        "node"
    }

    fn default_image(&self) -> &'static str {
        "node:18-alpine"
    }

    fn default_package_manager(&self) -> &'static str {
        "npm"
    }

    fn run_command(&self, interpreter: &str, entry: &str) -> Vec<String> {
        vec![interpreter.to_string(), entry.to_string()]
    }

    fn syntax_check(&self, interpreter: &str) -> SyntaxCheck {
        SyntaxCheck::ScratchFile {
            argv: vec![interpreter.to_string(), "--check".to_string()],
            suffix: ".js",
        }
    }

    fn interpret_check(&self, output: &CheckOutput) -> Vec<SyntaxError> {
        if output.exit_code == Some(0) {
            return Vec::new();
        }

        // node --check prints: "<file>:<line>", the offending source line, a caret
        // marker, a blank line, then "SyntaxError: <message>".
        let lines: Vec<&str> = output.stderr.lines().collect();
        let mut line_no = None;
        let mut column = None;
        for (idx, text) in lines.iter().enumerate() {
            if let Some(caps) = LOCATION_RE.captures(text) {
                line_no = caps[1].parse::<u32>().ok();
                if let Some(marker) = lines.get(idx + 2) {
                    if let Some(pos) = marker.find('^') {
                        if marker[..pos].trim().is_empty() {
                            column = Some(pos as u32 + 1);
                        }
                    }
                }
                break;
            }
        }
        let message = lines
            .iter()
            .find(|l| l.contains("SyntaxError"))
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| {
                let detail = output.stderr.trim();
                if detail.is_empty() {
                    format!("node --check exited with {:?}", output.exit_code)
                } else {
                    detail.lines().next().unwrap_or(detail).to_string()
                }
            });

        vec![SyntaxError {
            line: line_no,
            column,
            message,
        }]
    }

    fn extract_dependencies(&self, source: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        for re in [&*REQUIRE_RE, &*IMPORT_FROM_RE, &*DYNAMIC_IMPORT_RE] {
            for caps in re.captures_iter(source) {
                if let Some(name) = package_of(&caps[1]) {
                    found.insert(name);
                }
            }
        }
        found
    }

    fn install_command(&self, tool: &str, workspace: &Path, package: &str) -> Vec<String> {
        vec![
            tool.to_string(),
            "install".to_string(),
            "--no-audit".to_string(),
            "--no-fund".to_string(),
            "--prefix".to_string(),
            workspace.to_string_lossy().to_string(),
            package.to_string(),
        ]
    }

    fn installed_version(
        &self,
        workspace: &Path,
        package: &str,
        _installer_stdout: &str,
    ) -> Option<String> {
        let manifest = workspace
            .join("node_modules")
            .join(requested_name(package))
            .join("package.json");
        let content = std::fs::read_to_string(manifest).ok()?;
        let value: serde_json::Value = serde_json::from_str(&content).ok()?;
        value.get("version")?.as_str().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_require_import_and_dynamic_import() {
        let src = r#"
const { Telegraf } = require('telegraf');
const fs = require("fs");
const helper = require('./helper');
import axios from "axios";
import { REST } from '@discordjs/rest';
import * as _ from 'lodash/fp';
import 'dotenv/config';
import path from 'node:path';
const mod = await import('chalk');
const again = require('telegraf');
"#;
        let deps: Vec<String> = JavaScriptAdapter.extract_dependencies(src).into_iter().collect();
        assert_eq!(
            deps,
            vec!["@discordjs/rest", "axios", "chalk", "dotenv", "lodash", "telegraf"]
        );
    }

    #[test]
    fn test_interpret_node_check_output() {
        let stderr = "/tmp/.tmpA1b2/check.js:2\nlet y = );\n        ^\n\nSyntaxError: Unexpected token ')'\n    at internalCompileFunction (node:internal/vm:73:18)\n";
        let errors = JavaScriptAdapter.interpret_check(&CheckOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, Some(2));
        assert_eq!(errors[0].column, Some(9));
        assert_eq!(errors[0].message, "SyntaxError: Unexpected token ')'");
    }

    #[test]
    fn test_successful_check_has_no_errors() {
        let errors = JavaScriptAdapter.interpret_check(&CheckOutput {
            exit_code: Some(0),
            ..CheckOutput::default()
        });
        assert!(errors.is_empty());
    }

    #[test]
    fn test_installed_version_reads_package_manifest() {
        let ws = tempfile::tempdir().unwrap();
        let pkg_dir = ws.path().join("node_modules").join("telegraf");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join("package.json"), r#"{"name":"telegraf","version":"4.15.3"}"#)
            .unwrap();
        assert_eq!(
            JavaScriptAdapter.installed_version(ws.path(), "telegraf@^4", ""),
            Some("4.15.3".to_string())
        );
        assert_eq!(JavaScriptAdapter.installed_version(ws.path(), "missing", ""), None);
    }
}
