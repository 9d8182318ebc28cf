use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
/// Async-safe signal handling and process-group termination
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Initialize signal handlers
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self, String> {
        Self::install_signal_handlers()?;
        Ok(Self)
    }

    /// Install signal handlers for SIGINT, SIGTERM, SIGHUP
    fn install_signal_handlers() -> Result<(), String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        // SAFETY: the handler only touches atomics.
        unsafe {
            signal::sigaction(Signal::SIGINT, &sig_action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;

            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;

            signal::sigaction(Signal::SIGHUP, &sig_action)
                .map_err(|e| format!("Failed to install SIGHUP handler: {}", e))?;
        }

        debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(())
    }

    /// Async-safe signal handler
    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Get signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, waking early when a signal arrives.
    /// Returns true if a signal was received.
    pub fn wait_for_signal(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.shutdown_requested() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50).min(timeout));
        }
        self.shutdown_requested()
    }
}

/// Detach from terminal hangups. Used by processes that must outlive the
/// session that launched them.
pub fn ignore_hangup() -> Result<(), String> {
    // SAFETY: SIG_IGN installs no handler code.
    unsafe { signal::signal(Signal::SIGHUP, SigHandler::SigIgn) }
        .map(|_| ())
        .map_err(|e| format!("Failed to ignore SIGHUP: {}", e))
}

/// How a process group went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was there to signal
    AlreadyGone,
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Killed,
}

/// Whether any member of process group `pgid` still exists.
pub fn group_alive(pgid: i32) -> bool {
    match signal::killpg(Pid::from_raw(pgid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// SIGTERM the group, wait up to `grace` for `exited()` to report true, then SIGKILL.
///
/// `exited` lets the caller reap its own child; zombies still answer signal probes.
pub fn terminate_group<F>(pgid: i32, grace: Duration, mut exited: F) -> Termination
where
    F: FnMut() -> bool,
{
    if pgid <= 1 {
        warn!("Refusing to signal process group {}", pgid);
        return Termination::AlreadyGone;
    }
    let group = Pid::from_raw(pgid);

    match signal::killpg(group, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            exited();
            return Termination::AlreadyGone;
        }
        Err(e) => warn!("SIGTERM to process group {} failed: {}", pgid, e),
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if exited() {
            debug!("Process group {} exited after SIGTERM", pgid);
            return Termination::Graceful;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    info!("Process group {} ignored SIGTERM for {:?}, sending SIGKILL", pgid, grace);
    let _ = signal::killpg(group, Signal::SIGKILL);

    let reap_deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < reap_deadline {
        if exited() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Termination::Killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn test_signal_handler_init() {
        let handler = SignalHandler::init();
        assert!(handler.is_ok());
    }

    #[test]
    fn test_shutdown_flag() {
        let handler = SignalHandler::init().unwrap();
        SIGNAL_RECEIVED.store(libc::SIGTERM as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        assert!(handler.shutdown_requested());
        assert_eq!(handler.get_signal(), libc::SIGTERM as u32);
        assert!(handler.wait_for_signal(Duration::from_millis(10)));
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    }

    #[test]
    fn test_terminate_group_sigterm() {
        let mut child = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        let pgid = child.id() as i32;
        assert!(group_alive(pgid));
        let outcome = terminate_group(pgid, Duration::from_secs(5), || {
            matches!(child.try_wait(), Ok(Some(_)))
        });
        assert_eq!(outcome, Termination::Graceful);
        assert!(!group_alive(pgid));
    }

    #[test]
    fn test_terminate_group_escalates_to_sigkill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = child.id() as i32;
        std::thread::sleep(Duration::from_millis(100));
        let outcome = terminate_group(pgid, Duration::from_millis(200), || {
            matches!(child.try_wait(), Ok(Some(_)))
        });
        assert_eq!(outcome, Termination::Killed);
    }

    #[test]
    fn test_refuses_init_group() {
        assert_eq!(
            terminate_group(1, Duration::from_millis(1), || true),
            Termination::AlreadyGone
        );
    }
}
