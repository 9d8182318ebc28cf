/// Per-bot workspaces: `<root>/user_<uid>/bot_<id>`
///
/// Uploads are first unpacked into a staging directory under the root, so the
/// language and entry point are known before a bot id exists, then renamed into
/// place in one step.
use crate::config::types::{BotError, BotId, Result, UserId};
use crate::lang::{Language, UploadKind};
use crate::safety::safe_cleanup;
use log::{debug, info, warn};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Append-only output sink inside every workspace.
pub const LOG_SINK: &str = ".botbox.log";

const STAGING_DIR: &str = ".staging";

/// Entry file names picked, in order, when an archive holds several candidates.
pub const PREFERRED_ENTRIES: &[&str] = &["main.py", "bot.py", "app.py", "index.js", "main.js", "bot.js"];

/// Upload size bounds
#[derive(Debug, Clone)]
pub struct WorkspaceLimits {
    pub max_upload_bytes: u64,
    pub max_archive_entries: usize,
    pub max_extracted_bytes: u64,
}

impl Default for WorkspaceLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            max_archive_entries: 512,
            max_extracted_bytes: 50 * 1024 * 1024,
        }
    }
}

/// An unpacked upload waiting to become a workspace.
#[derive(Debug)]
pub struct StagedUpload {
    dir: TempDir,
    /// Directory whose contents become the workspace
    content_root: PathBuf,
    pub language: Language,
    /// Entry path relative to the workspace
    pub entry: String,
    /// Entry source text
    pub source: String,
}

impl StagedUpload {
    pub fn content_root(&self) -> &Path {
        &self.content_root
    }
}

pub trait WorkspaceAllocator: Send + Sync {
    fn root(&self) -> &Path;

    /// Workspace directory of one bot. Distinct (user, bot) pairs never share a path.
    fn path_for(&self, user_id: UserId, bot_id: BotId) -> PathBuf;

    /// Unpack an upload and discover its entry artifact.
    fn stage(&self, filename: &str, bytes: &[u8]) -> Result<StagedUpload>;

    /// Move a staged upload into the bot's workspace, replacing any previous
    /// content wholesale.
    fn commit(&self, user_id: UserId, bot_id: BotId, staged: StagedUpload) -> Result<PathBuf>;

    /// Recursively remove the bot's workspace. Missing workspaces are not an error.
    fn destroy(&self, user_id: UserId, bot_id: BotId) -> Result<()>;

    fn log_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(LOG_SINK)
    }
}

/// Filesystem-backed allocator
#[derive(Debug, Clone)]
pub struct FsWorkspaceAllocator {
    root: PathBuf,
    limits: WorkspaceLimits,
}

fn ws_err(context: &str, path: &Path, e: impl std::fmt::Display) -> BotError {
    BotError::Workspace(format!("{} {}: {}", context, path.display(), e))
}

impl FsWorkspaceAllocator {
    /// Root is made absolute here; every workspace path is derived from it
    /// plus both ids, so two bots can never be handed the same directory.
    pub fn new(root: &Path, limits: WorkspaceLimits) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| ws_err("Failed to create workspace root", root, e))?;
        let root = root
            .canonicalize()
            .map_err(|e| ws_err("Failed to resolve workspace root", root, e))?;
        fs::create_dir_all(root.join(STAGING_DIR))
            .map_err(|e| ws_err("Failed to create staging directory", &root, e))?;
        Ok(Self { root, limits })
    }

    fn staging_dir(&self) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix("upload-")
            .tempdir_in(self.root.join(STAGING_DIR))
            .map_err(|e| ws_err("Failed to create staging directory in", &self.root, e))
    }

    fn stage_source(&self, dir: TempDir, filename: &str, language: Language, bytes: &[u8]) -> Result<StagedUpload> {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.starts_with('.'))
            .ok_or_else(|| BotError::UnsupportedUpload(format!("invalid file name '{}'", filename)))?
            .to_string();
        let source = String::from_utf8(bytes.to_vec())
            .map_err(|_| BotError::UnsupportedUpload(format!("{} is not UTF-8 text", name)))?;
        let path = dir.path().join(&name);
        fs::write(&path, bytes).map_err(|e| ws_err("Failed to write", &path, e))?;

        let content_root = dir.path().to_path_buf();
        Ok(StagedUpload {
            dir,
            content_root,
            language,
            entry: name,
            source,
        })
    }

    fn stage_archive(&self, dir: TempDir, bytes: &[u8]) -> Result<StagedUpload> {
        extract_zip(bytes, dir.path(), &self.limits)?;

        // Archives that wrap everything in one folder are unwrapped.
        let mut content_root = dir.path().to_path_buf();
        loop {
            let entries = list_dir(&content_root)?;
            match entries.as_slice() {
                [only] if only.is_dir() => content_root = only.clone(),
                _ => break,
            }
        }

        let entry = discover_entry(&content_root)?;
        let language = Path::new(&entry)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Language::from_extension)
            .ok_or_else(|| BotError::UnsupportedUpload(format!("unsupported entry {}", entry)))?;
        let entry_path = content_root.join(&entry);
        let raw = fs::read(&entry_path).map_err(|e| ws_err("Failed to read", &entry_path, e))?;
        let source = String::from_utf8(raw)
            .map_err(|_| BotError::UnsupportedUpload(format!("{} is not UTF-8 text", entry)))?;

        Ok(StagedUpload {
            dir,
            content_root,
            language,
            entry,
            source,
        })
    }
}

impl WorkspaceAllocator for FsWorkspaceAllocator {
    fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, user_id: UserId, bot_id: BotId) -> PathBuf {
        self.root
            .join(format!("user_{}", user_id))
            .join(format!("bot_{}", bot_id))
    }

    fn stage(&self, filename: &str, bytes: &[u8]) -> Result<StagedUpload> {
        if bytes.len() as u64 > self.limits.max_upload_bytes {
            return Err(BotError::UnsupportedUpload(format!(
                "upload is {} bytes, limit is {}",
                bytes.len(),
                self.limits.max_upload_bytes
            )));
        }
        let kind = UploadKind::from_filename(filename).ok_or_else(|| {
            BotError::UnsupportedUpload(format!(
                "'{}': only .py, .js and .zip files are accepted",
                filename
            ))
        })?;

        let dir = self.staging_dir()?;
        match kind {
            UploadKind::Source(language) => self.stage_source(dir, filename, language, bytes),
            UploadKind::Archive => self.stage_archive(dir, bytes),
        }
    }

    fn commit(&self, user_id: UserId, bot_id: BotId, staged: StagedUpload) -> Result<PathBuf> {
        let target = self.path_for(user_id, bot_id);
        let parent = target
            .parent()
            .ok_or_else(|| ws_err("Workspace has no parent", &target, "invalid path"))?;
        fs::create_dir_all(parent).map_err(|e| ws_err("Failed to create", parent, e))?;

        let previous = if fs::symlink_metadata(&target).is_ok() {
            let trash = self
                .root
                .join(STAGING_DIR)
                .join(format!("replaced-{}-{}", bot_id, std::process::id()));
            safe_cleanup::remove_tree_secure(&trash)?;
            fs::rename(&target, &trash).map_err(|e| ws_err("Failed to move aside", &target, e))?;
            Some(trash)
        } else {
            None
        };

        if let Err(e) = fs::rename(&staged.content_root, &target) {
            if let Some(trash) = &previous {
                if let Err(restore) = fs::rename(trash, &target) {
                    warn!("Could not restore workspace {}: {}", target.display(), restore);
                }
            }
            return Err(ws_err("Failed to install workspace", &target, e));
        }

        if let Some(trash) = previous {
            if let Err(e) = safe_cleanup::remove_tree_secure(&trash) {
                warn!("Leftover replaced workspace {}: {}", trash.display(), e);
            }
        }
        // `staged.dir` drops here; its path may already be gone.
        drop(staged.dir);

        info!("Workspace ready for bot {} at {}", bot_id, target.display());
        Ok(target)
    }

    fn destroy(&self, user_id: UserId, bot_id: BotId) -> Result<()> {
        let target = self.path_for(user_id, bot_id);
        safe_cleanup::remove_tree_secure(&target)?;
        if let Some(user_dir) = target.parent() {
            // Only succeeds once the user has no bots left.
            let _ = fs::remove_dir(user_dir);
        }
        debug!("Destroyed workspace {}", target.display());
        Ok(())
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| ws_err("Failed to list", dir, e))? {
        let entry = entry.map_err(|e| ws_err("Failed to list", dir, e))?;
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

/// Single entry point among the top-level files of `dir`.
pub fn discover_entry(dir: &Path) -> Result<String> {
    let candidates: Vec<String> = list_dir(dir)?
        .into_iter()
        .filter(|p| p.is_file())
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .filter(|name| {
            Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .and_then(Language::from_extension)
                .is_some()
        })
        .collect();

    if let Some(preferred) = PREFERRED_ENTRIES
        .iter()
        .find(|p| candidates.iter().any(|c| c == *p))
    {
        return Ok(preferred.to_string());
    }
    match candidates.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(BotError::UnsupportedUpload(
            "archive contains no .py or .js file at its top level".to_string(),
        )),
        many => Err(BotError::UnsupportedUpload(format!(
            "archive has {} candidate entry files ({}); name one of them main.py or index.js",
            many.len(),
            many.join(", ")
        ))),
    }
}

/// Extract a zip archive into `dest`, rejecting path traversal and bounding
/// entry count and total size.
pub fn extract_zip(bytes: &[u8], dest: &Path, limits: &WorkspaceLimits) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| BotError::UnsupportedUpload(format!("not a valid zip archive: {}", e)))?;
    if archive.len() > limits.max_archive_entries {
        return Err(BotError::UnsupportedUpload(format!(
            "archive has {} entries, limit is {}",
            archive.len(),
            limits.max_archive_entries
        )));
    }

    let mut written: u64 = 0;
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| BotError::UnsupportedUpload(format!("corrupt archive entry: {}", e)))?;
        let relative = file.enclosed_name().ok_or_else(|| {
            BotError::UnsupportedUpload(format!("archive entry '{}' escapes the workspace", file.name()))
        })?;
        let out_path = dest.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| ws_err("Failed to create", &out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ws_err("Failed to create", parent, e))?;
        }

        let remaining = limits.max_extracted_bytes.saturating_sub(written);
        let mut out = fs::File::create(&out_path).map_err(|e| ws_err("Failed to create", &out_path, e))?;
        let mut limited = (&mut file).take(remaining + 1);
        let mut buf = [0u8; 8192];
        loop {
            let n = limited
                .read(&mut buf)
                .map_err(|e| BotError::UnsupportedUpload(format!("corrupt archive entry: {}", e)))?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > limits.max_extracted_bytes {
                return Err(BotError::UnsupportedUpload(format!(
                    "archive expands beyond {} bytes",
                    limits.max_extracted_bytes
                )));
            }
            out.write_all(&buf[..n]).map_err(|e| ws_err("Failed to write", &out_path, e))?;
        }
    }
    Ok(())
}
