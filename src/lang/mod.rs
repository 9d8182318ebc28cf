//! Language adapters.
//!
//! The supervisor stays language-agnostic. Each [`Language`] variant resolves to one
//! adapter carrying its file extension, interpreter command, parser invocation,
//! import conventions and package manager.

pub mod adapter;
pub mod javascript;
pub mod python;

use crate::lang::adapter::LanguageAdapter;
use crate::lang::javascript::JavaScriptAdapter;
use crate::lang::python::PythonAdapter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    #[serde(rename = "javascript")]
    JavaScript,
}

static PYTHON: PythonAdapter = PythonAdapter;
static JAVASCRIPT: JavaScriptAdapter = JavaScriptAdapter;

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::JavaScript];

    pub fn adapter(self) -> &'static dyn LanguageAdapter {
        match self {
            Self::Python => &PYTHON,
            Self::JavaScript => &JAVASCRIPT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
        }
    }

    pub fn extension(self) -> &'static str {
        self.adapter().extension()
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|lang| lang.extension().eq_ignore_ascii_case(ext))
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Some(Self::Python),
            "javascript" | "js" | "node" | "nodejs" => Some(Self::JavaScript),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an uploaded file turns into, decided purely from its file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadKind {
    Source(Language),
    /// `.zip` archive whose entry point is discovered after extraction
    Archive,
}

impl UploadKind {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename).extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("zip") {
            return Some(Self::Archive);
        }
        Language::from_extension(ext).map(Self::Source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_kind_from_filename() {
        assert_eq!(
            UploadKind::from_filename("bot.py"),
            Some(UploadKind::Source(Language::Python))
        );
        assert_eq!(
            UploadKind::from_filename("index.JS"),
            Some(UploadKind::Source(Language::JavaScript))
        );
        assert_eq!(UploadKind::from_filename("bundle.zip"), Some(UploadKind::Archive));
        assert_eq!(UploadKind::from_filename("main.rb"), None);
        assert_eq!(UploadKind::from_filename("Makefile"), None);
    }

    #[test]
    fn test_adapter_dispatch_is_consistent() {
        for lang in Language::ALL {
            assert_eq!(lang.adapter().language(), lang);
            assert_eq!(Language::from_extension(lang.extension()), Some(lang));
            assert_eq!(Language::parse(lang.as_str()), Some(lang));
        }
    }
}
