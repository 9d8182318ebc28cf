/// Per-bot operation locks built on flock(2)
///
/// One lock file per bot id under `<root>/.locks`. flock serializes callers in the
/// same process (each acquisition opens its own file description) and across
/// processes, and the kernel drops the lock when its holder dies, so a crashed
/// supervisor never leaves a bot wedged.
use crate::config::types::{BotId, LockError, LockResult};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Diagnostic content of a held lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    bot_id: BotId,
    acquired_at: SystemTime,
}

/// Exclusive or shared flock on an open file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    fn open(path: &Path) -> LockResult<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Never truncate before holding the lock.
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?)
    }

    fn flock(file: &File, operation: i32) -> std::io::Result<bool> {
        // SAFETY: the descriptor is owned by `file` for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => Ok(false),
            _ => Err(err),
        }
    }

    /// Block until the lock is held.
    pub fn acquire_blocking(path: &Path, exclusive: bool) -> LockResult<Self> {
        let file = Self::open(path)?;
        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        loop {
            match Self::flock(&file, op) {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LockError::System(format!("flock {}: {}", path.display(), e))),
            }
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Single non-blocking exclusive attempt.
    pub fn try_acquire(path: &Path) -> LockResult<Option<Self>> {
        let file = Self::open(path)?;
        match Self::flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(true) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Ok(false) => Ok(None),
            Err(e) => Err(LockError::System(format!("flock {}: {}", path.display(), e))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; closing it would also release the lock.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Run `operation` while holding a flock on a dedicated `.lock` file next to
/// `file_path`. The data file itself is never opened for locking.
pub fn with_file_lock<T, E, F>(file_path: &Path, exclusive: bool, operation: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<LockError>,
{
    let lock_path = file_path.with_extension(
        file_path
            .extension()
            .map(|e| format!("{}.lock", e.to_string_lossy()))
            .unwrap_or_else(|| "lock".to_string()),
    );
    let _lock = FileLock::acquire_blocking(&lock_path, exclusive)?;
    operation()
}

/// Issues per-bot locks with bounded waiting.
#[derive(Debug, Clone)]
pub struct BotLockManager {
    lock_dir: PathBuf,
    active_locks: Arc<AtomicU64>,
    contentions: Arc<AtomicU64>,
}

/// RAII guard for a bot lock
#[derive(Debug)]
pub struct BotLockGuard {
    bot_id: BotId,
    lock: FileLock,
    active_locks: Arc<AtomicU64>,
}

impl BotLockGuard {
    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }
}

impl Drop for BotLockGuard {
    fn drop(&mut self) {
        // Empty file means released.
        let _ = self.lock.file.set_len(0);
        self.active_locks.fetch_sub(1, Ordering::AcqRel);
        debug!("Released lock for bot {}", self.bot_id);
    }
}

impl BotLockManager {
    pub fn new(lock_dir: PathBuf) -> LockResult<Self> {
        std::fs::create_dir_all(&lock_dir).map_err(|e| {
            LockError::System(format!(
                "Cannot create lock directory {}: {}",
                lock_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            lock_dir,
            active_locks: Arc::new(AtomicU64::new(0)),
            contentions: Arc::new(AtomicU64::new(0)),
        })
    }

    fn lock_path(&self, bot_id: BotId) -> PathBuf {
        self.lock_dir.join(format!("bot-{}.lock", bot_id))
    }

    /// Acquire the lock for `bot_id`, retrying with exponential backoff until `timeout`.
    pub fn acquire(&self, bot_id: BotId, timeout: Duration) -> LockResult<BotLockGuard> {
        let start = Instant::now();
        let path = self.lock_path(bot_id);
        let mut retry_delay = Duration::from_millis(5);

        loop {
            if let Some(mut lock) = FileLock::try_acquire(&path)? {
                if let Err(e) = write_lock_info(&mut lock.file, bot_id) {
                    warn!("Could not record lock owner for bot {}: {}", bot_id, e);
                }
                self.active_locks.fetch_add(1, Ordering::AcqRel);
                debug!("Acquired lock for bot {} in {:?}", bot_id, start.elapsed());
                return Ok(BotLockGuard {
                    bot_id,
                    lock,
                    active_locks: Arc::clone(&self.active_locks),
                });
            }

            self.contentions.fetch_add(1, Ordering::Relaxed);
            let waited = start.elapsed();
            if waited >= timeout {
                if let Some(pid) = self.lock_owner(bot_id) {
                    warn!("Bot {} lock still held by pid {} after {:?}", bot_id, pid, waited);
                }
                return Err(LockError::Timeout { bot_id, waited });
            }
            let remaining = timeout - waited;
            thread::sleep(retry_delay.min(remaining));
            retry_delay = std::cmp::min(retry_delay * 2, Duration::from_millis(200));
        }
    }

    /// Pid recorded by the current holder, if any.
    pub fn lock_owner(&self, bot_id: BotId) -> Option<u32> {
        let content = std::fs::read_to_string(self.lock_path(bot_id)).ok()?;
        let info: LockInfo = serde_json::from_str(content.lines().next()?).ok()?;
        Some(info.pid)
    }

    /// Drop the lock file of a deleted bot. Only call while holding its guard.
    pub fn forget(&self, guard: &BotLockGuard) {
        let _ = std::fs::remove_file(guard.lock.path());
    }

    pub fn active_locks(&self) -> u64 {
        self.active_locks.load(Ordering::Acquire)
    }

    pub fn contentions(&self) -> u64 {
        self.contentions.load(Ordering::Relaxed)
    }
}

fn write_lock_info(file: &mut File, bot_id: BotId) -> std::io::Result<()> {
    let info = LockInfo {
        pid: std::process::id(),
        bot_id,
        acquired_at: SystemTime::now(),
    };
    let json = serde_json::to_string(&info).map_err(std::io::Error::other)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", json)?;
    let pos = file.stream_position()?;
    file.set_len(pos)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BotLockManager::new(dir.path().join("locks")).unwrap();
        {
            let guard = manager.acquire(1, Duration::from_secs(1)).unwrap();
            assert_eq!(guard.bot_id(), 1);
            assert_eq!(manager.active_locks(), 1);
            assert_eq!(manager.lock_owner(1), Some(std::process::id()));
        }
        assert_eq!(manager.active_locks(), 0);
        assert_eq!(manager.lock_owner(1), None);
        assert!(manager.acquire(1, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_second_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BotLockManager::new(dir.path().to_path_buf()).unwrap();
        let _held = manager.acquire(7, Duration::from_secs(1)).unwrap();

        let err = manager.acquire(7, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { bot_id: 7, .. }));
        assert!(manager.contentions() > 0);

        // Other bots are unaffected.
        assert!(manager.acquire(8, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_lock_serializes_threads() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BotLockManager::new(dir.path().to_path_buf()).unwrap();
        let inside = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let inside = Arc::clone(&inside);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let _guard = manager.acquire(3, Duration::from_secs(10)).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_shared_file_lock_allows_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let a = FileLock::acquire_blocking(&path, false).unwrap();
        let b = FileLock::acquire_blocking(&path, false).unwrap();
        assert!(FileLock::try_acquire(&path).unwrap().is_none());
        drop(a);
        drop(b);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }
}
