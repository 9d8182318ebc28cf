use crate::config::types::{BotError, Result};
use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct FdGuard(RawFd);

impl FdGuard {
    fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            // SAFETY: the guard owns this descriptor.
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

/// Owns a `DIR*` stream so every early return closes it.
struct DirGuard(*mut libc::DIR);

impl Drop for DirGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: the stream came from fdopendir and is closed exactly once.
            unsafe {
                libc::closedir(self.0);
            }
        }
    }
}

fn fs_err(msg: String) -> BotError {
    BotError::Workspace(msg)
}

fn open_dir_nofollow(path: &Path) -> Result<FdGuard> {
    let path_c = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        fs_err(format!(
            "Path contains NUL byte and cannot be opened safely: {}",
            path.display()
        ))
    })?;

    // SAFETY: path_c is a valid NUL-terminated string.
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if fd < 0 {
        return Err(fs_err(format!(
            "open directory failed for {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(FdGuard::new(fd))
}

fn fstatat_nofollow(parent_fd: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    // SAFETY: st points to writable storage of the right size.
    let rc = unsafe {
        libc::fstatat(
            parent_fd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(fs_err(format!(
            "fstatat failed for {:?}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: fstatat succeeded and filled the struct.
    Ok(unsafe { st.assume_init() })
}

fn remove_entry_at(parent_fd: RawFd, name: &CStr, flags: i32) -> Result<()> {
    // SAFETY: name is NUL-terminated and parent_fd is an open directory.
    let rc = unsafe { libc::unlinkat(parent_fd, name.as_ptr(), flags) };
    if rc != 0 {
        return Err(fs_err(format!(
            "unlinkat failed for entry {:?}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Descend into `name` by descriptor and empty it before unlinking it.
///
/// `O_NOFOLLOW` on the `openat` closes the window where a bot swaps a checked
/// directory for a symlink between the `fstatat` and the descent.
fn recurse_remove_dir(parent_fd: RawFd, name: &CStr, root_dev: libc::dev_t) -> Result<()> {
    // SAFETY: name is NUL-terminated and parent_fd is an open directory.
    let child_fd = unsafe {
        libc::openat(
            parent_fd,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if child_fd < 0 {
        return Err(fs_err(format!(
            "openat failed for child directory {:?}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    let child = FdGuard::new(child_fd);

    remove_dir_contents_fd(child.as_raw_fd(), root_dev)?;
    remove_entry_at(parent_fd, name, libc::AT_REMOVEDIR)
}

/// Names in the directory behind `dir_fd`, without `.` and `..`.
///
/// The listing is taken in full before anything is unlinked, so removal never
/// races the directory stream.
fn entry_names(dir_fd: RawFd) -> Result<Vec<CString>> {
    // SAFETY: dir_fd is open; the duplicate is handed to fdopendir.
    let iter_fd = unsafe { libc::dup(dir_fd) };
    if iter_fd < 0 {
        return Err(fs_err(format!(
            "dup for directory listing failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: iter_fd is a fresh descriptor owned by the stream on success.
    let stream = unsafe { libc::fdopendir(iter_fd) };
    if stream.is_null() {
        // SAFETY: fdopendir failed so iter_fd is still ours to close.
        unsafe {
            libc::close(iter_fd);
        }
        return Err(fs_err(format!(
            "fdopendir failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let stream = DirGuard(stream);

    let mut names = Vec::new();
    loop {
        // SAFETY: errno is thread-local.
        unsafe {
            *libc::__errno_location() = 0;
        }
        // SAFETY: stream.0 is a valid stream until the guard drops.
        let entry = unsafe { libc::readdir(stream.0) };
        if entry.is_null() {
            // SAFETY: errno is thread-local.
            let errno = unsafe { *libc::__errno_location() };
            if errno != 0 {
                return Err(fs_err(format!(
                    "readdir failed: {}",
                    std::io::Error::from_raw_os_error(errno)
                )));
            }
            return Ok(names);
        }
        // SAFETY: d_name is NUL-terminated and valid until the next readdir.
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if !matches!(name.to_bytes(), b"." | b"..") {
            names.push(name.to_owned());
        }
    }
}

/// Empty a workspace directory. Whatever a bot left behind that is not a real
/// directory, symlinks included, is unlinked as a plain entry. Only
/// directories on the workspace's own filesystem are descended into, so a
/// mount point stops the walk instead of being emptied.
fn remove_dir_contents_fd(dir_fd: RawFd, root_dev: libc::dev_t) -> Result<()> {
    for name in entry_names(dir_fd)? {
        let st = fstatat_nofollow(dir_fd, &name)?;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            remove_entry_at(dir_fd, &name, 0)?;
            continue;
        }
        if st.st_dev != root_dev {
            return Err(fs_err(format!(
                "Refusing to cross filesystem boundary at directory {:?}",
                name
            )));
        }
        recurse_remove_dir(dir_fd, &name, root_dev)?;
    }
    Ok(())
}

/// Remove a tree without following symlinks, using openat/fstatat/unlinkat.
///
/// A symlink planted inside a workspace is unlinked, never traversed, so a bot
/// cannot steer deletion outside its own directory.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    let parent = path.parent().ok_or_else(|| {
        fs_err(format!("Cannot remove path without parent: {}", path.display()))
    })?;
    let name_os = path.file_name().ok_or_else(|| {
        fs_err(format!("Cannot remove path without file name: {}", path.display()))
    })?;
    let name_c = CString::new(name_os.as_bytes()).map_err(|_| {
        fs_err(format!(
            "Path contains NUL byte and cannot be removed safely: {}",
            path.display()
        ))
    })?;

    let parent_fd = open_dir_nofollow(parent)?;
    let st = fstatat_nofollow(parent_fd.as_raw_fd(), &name_c)?;
    let file_type = st.st_mode & libc::S_IFMT;

    if file_type == libc::S_IFDIR {
        recurse_remove_dir(parent_fd.as_raw_fd(), &name_c, st.st_dev)?;
    } else {
        remove_entry_at(parent_fd.as_raw_fd(), &name_c, 0)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_removes_nested_tree() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("bot_1");
        fs::create_dir_all(target.join("node_modules/pkg/lib")).unwrap();
        fs::write(target.join("bot.js"), "console.log(1)").unwrap();
        fs::write(target.join("node_modules/pkg/lib/index.js"), "").unwrap();

        remove_tree_secure(&target).unwrap();
        assert!(!target.exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_does_not_follow_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let outside = root.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("keep.txt"), "precious").unwrap();

        let target = root.path().join("bot_2");
        fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(&outside, target.join("escape")).unwrap();

        remove_tree_secure(&target).unwrap();
        assert!(!target.exists());
        assert_eq!(fs::read_to_string(outside.join("keep.txt")).unwrap(), "precious");
    }

    #[test]
    fn test_unlinks_file_symlinks_and_dangling_links_only() {
        let root = tempfile::tempdir().unwrap();
        let secret = root.path().join("secret.txt");
        fs::write(&secret, "host data").unwrap();

        let target = root.path().join("bot_3");
        fs::create_dir_all(target.join("deep/er")).unwrap();
        std::os::unix::fs::symlink(&secret, target.join("deep/er/link.txt")).unwrap();
        std::os::unix::fs::symlink(root.path().join("nowhere"), target.join("dangling")).unwrap();

        remove_tree_secure(&target).unwrap();
        assert!(!target.exists());
        assert_eq!(fs::read_to_string(&secret).unwrap(), "host data");
    }

    #[test]
    fn test_top_level_symlink_is_unlinked_not_followed() {
        let root = tempfile::tempdir().unwrap();
        let real = root.path().join("real");
        fs::create_dir(&real).unwrap();
        fs::write(real.join("keep.txt"), "stay").unwrap();
        let link = root.path().join("bot_4");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        remove_tree_secure(&link).unwrap();
        assert!(fs::symlink_metadata(&link).is_err());
        assert!(real.join("keep.txt").exists());
    }

    #[test]
    fn test_missing_path_is_ok() {
        let root = tempfile::tempdir().unwrap();
        assert!(remove_tree_secure(&root.path().join("never")).is_ok());
    }
}
