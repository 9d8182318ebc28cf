use crate::config::types::SyntaxError;
use crate::lang::adapter::{requested_name, CheckOutput, LanguageAdapter, SyntaxCheck};
use crate::lang::Language;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct PythonAdapter;

/// Parses stdin with the interpreter's own grammar; never executes the candidate.
const PARSE_SCRIPT: &str = r#"import ast, json, sys
src = sys.stdin.buffer.read()
try:
    ast.parse(src, filename="<upload>")
except SyntaxError as e:
    print(json.dumps({"line": e.lineno, "column": e.offset, "message": e.msg}))
    sys.exit(1)
except ValueError as e:
    print(json.dumps({"line": None, "column": None, "message": str(e)}))
    sys.exit(1)
"#;

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*import\s+([^#;]+)").expect("static regex"));
static FROM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\b").expect("static regex"));

/// Top-level standard library modules never treated as installable dependencies.
const STDLIB: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "atexit", "base64", "binascii",
    "bisect", "builtins", "bz2", "calendar", "cgi", "cmath", "cmd", "codecs", "collections",
    "colorsys", "concurrent", "configparser", "contextlib", "contextvars", "copy", "csv",
    "ctypes", "curses", "dataclasses", "datetime", "dbm", "decimal", "difflib", "dis", "email",
    "encodings", "enum", "errno", "faulthandler", "fcntl", "filecmp", "fileinput", "fnmatch",
    "fractions", "ftplib", "functools", "gc", "getopt", "getpass", "gettext", "glob", "graphlib",
    "grp", "gzip", "hashlib", "heapq", "hmac", "html", "http", "imaplib", "importlib", "inspect",
    "io", "ipaddress", "itertools", "json", "keyword", "linecache", "locale", "logging", "lzma",
    "mailbox", "marshal", "math", "mimetypes", "mmap", "multiprocessing", "netrc", "numbers",
    "operator", "optparse", "os", "pathlib", "pdb", "pickle", "pkgutil", "platform", "plistlib",
    "poplib", "posixpath", "pprint", "profile", "pstats", "pty", "pwd", "queue", "random", "re",
    "readline", "reprlib", "resource", "sched", "secrets", "select", "selectors", "shelve",
    "shlex", "shutil", "signal", "site", "smtplib", "socket", "socketserver", "sqlite3", "ssl",
    "stat", "statistics", "string", "struct", "subprocess", "sys", "sysconfig", "syslog",
    "tarfile", "tempfile", "termios", "textwrap", "threading", "time", "timeit", "tkinter",
    "token", "tokenize", "tomllib", "traceback", "tracemalloc", "tty", "types", "typing",
    "unicodedata", "unittest", "urllib", "uuid", "venv", "warnings", "wave", "weakref",
    "webbrowser", "wsgiref", "xml", "xmlrpc", "zipfile", "zipimport", "zlib", "zoneinfo",
];

#[derive(Deserialize)]
struct ParseFailure {
    line: Option<u32>,
    column: Option<u32>,
    message: String,
}

fn normalize_dist_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}

fn push_module(found: &mut BTreeSet<String>, dotted: &str) {
    let top = dotted.split('.').next().unwrap_or("").trim();
    if top.is_empty() || !top.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return;
    }
    if !STDLIB.contains(&top) {
        found.insert(top.to_string());
    }
}

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn extension(&self) -> &'static str {
        "py"
    }

    fn default_interpreter(&self) -> &'static str {
        "python3"
    }

    fn default_image(&self) -> &'static str {
        "python:3.11-slim"
    }

    fn default_package_manager(&self) -> &'static str {
        "python3"
    }

    fn run_command(&self, interpreter: &str, entry: &str) -> Vec<String> {
        // Unbuffered so the log sink sees output as it happens.
        vec![interpreter.to_string(), "-u".to_string(), entry.to_string()]
    }

    fn syntax_check(&self, interpreter: &str) -> SyntaxCheck {
        SyntaxCheck::Stdin {
            argv: vec![
                interpreter.to_string(),
                "-I".to_string(),
                "-S".to_string(),
                "-c".to_string(),
                PARSE_SCRIPT.to_string(),
            ],
        }
    }

    fn interpret_check(&self, output: &CheckOutput) -> Vec<SyntaxError> {
        if output.exit_code == Some(0) {
            return Vec::new();
        }
        let reported = output
            .stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<ParseFailure>(line.trim()).ok());
        match reported {
            Some(failure) => vec![SyntaxError {
                line: failure.line,
                column: failure.column,
                message: failure.message,
            }],
            None => {
                let detail = output.stderr.trim();
                vec![SyntaxError::diagnostic(if detail.is_empty() {
                    format!("python parser exited with {:?}", output.exit_code)
                } else {
                    detail.to_string()
                })]
            }
        }
    }

    fn extract_dependencies(&self, source: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        for line in source.lines() {
            if let Some(caps) = FROM_RE.captures(line) {
                // Relative imports never match: the capture must start with an identifier.
                push_module(&mut found, &caps[1]);
            } else if let Some(caps) = IMPORT_RE.captures(line) {
                for item in caps[1].split(',') {
                    let module = item.split_whitespace().next().unwrap_or("");
                    push_module(&mut found, module);
                }
            }
        }
        found
    }

    fn install_command(&self, tool: &str, workspace: &Path, package: &str) -> Vec<String> {
        vec![
            tool.to_string(),
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--disable-pip-version-check".to_string(),
            "--no-input".to_string(),
            "--upgrade".to_string(),
            "--target".to_string(),
            workspace.to_string_lossy().to_string(),
            package.to_string(),
        ]
    }

    fn installed_version(
        &self,
        _workspace: &Path,
        package: &str,
        installer_stdout: &str,
    ) -> Option<String> {
        let wanted = normalize_dist_name(requested_name(package));
        let line = installer_stdout
            .lines()
            .find(|l| l.trim_start().starts_with("Successfully installed"))?;
        line.split_whitespace().skip(2).find_map(|token| {
            let (name, version) = token.rsplit_once('-')?;
            (normalize_dist_name(name) == wanted).then(|| version.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_third_party_and_collapses_duplicates() {
        let deps = PythonAdapter.extract_dependencies("import os\nimport requests\nfrom os import path");
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["requests".to_string()]);
    }

    #[test]
    fn test_extract_handles_aliases_lists_and_nesting() {
        let src = "\
import numpy as np, json, aiogram.types
from telegram.ext import Application
from . import helpers
from .local import thing
def f():
    import yaml  # inline comment
# import commented_out
";
        let deps: Vec<String> = PythonAdapter.extract_dependencies(src).into_iter().collect();
        assert_eq!(deps, vec!["aiogram", "numpy", "telegram", "yaml"]);
    }

    #[test]
    fn test_interpret_check_reads_json_failure() {
        let output = CheckOutput {
            exit_code: Some(1),
            stdout: "{\"line\": 2, \"column\": 5, \"message\": \"unmatched ')'\"}\n".to_string(),
            stderr: String::new(),
        };
        let errors = PythonAdapter.interpret_check(&output);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, Some(2));
        assert_eq!(errors[0].column, Some(5));
    }

    #[test]
    fn test_interpret_check_falls_back_to_stderr() {
        let output = CheckOutput {
            exit_code: Some(2),
            stdout: String::new(),
            stderr: "Fatal Python error: init failed\n".to_string(),
        };
        let errors = PythonAdapter.interpret_check(&output);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, None);
        assert!(errors[0].message.contains("Fatal Python error"));
    }

    #[test]
    fn test_installed_version_from_pip_output() {
        let stdout = "Collecting python-telegram-bot\nSuccessfully installed anyio-4.2.0 python-telegram-bot-20.7 sniffio-1.3.0\n";
        assert_eq!(
            PythonAdapter.installed_version(Path::new("/ws"), "python_telegram_bot==20.7", stdout),
            Some("20.7".to_string())
        );
        assert_eq!(
            PythonAdapter.installed_version(Path::new("/ws"), "requests", stdout),
            None
        );
    }

    #[test]
    fn test_install_command_targets_workspace() {
        let argv = PythonAdapter.install_command("python3", Path::new("/srv/bots/u1/b2"), "requests");
        assert_eq!(argv[0], "python3");
        let target = argv.iter().position(|a| a == "--target").unwrap();
        assert_eq!(argv[target + 1], "/srv/bots/u1/b2");
        assert_eq!(argv.last().unwrap(), "requests");
    }
}
