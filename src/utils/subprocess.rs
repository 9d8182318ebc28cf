/// Bounded-time subprocess execution
///
/// Every command runs in its own process group. On timeout the whole group is
/// terminated, and after a normal exit any stragglers left in the group are
/// killed, so pipes close and no helper outlives the call.
use crate::config::types::{BotError, Result};
use crate::kernel::signal::terminate_group;
use crate::utils::output::{collect_stream, Collected, OutputLimits, Stream};
use log::{debug, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Grace between SIGTERM and SIGKILL for timed-out commands
const KILL_GRACE: Duration = Duration::from_millis(500);

/// How long to wait for pipe readers after the process is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub cwd: Option<&'a Path>,
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub limits: OutputLimits,
    pub env: Vec<(String, String)>,
}

impl<'a> RunOptions<'a> {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cwd: None,
            stdin: None,
            timeout,
            limits: OutputLimits::default(),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Output hit a collection limit
    pub truncated: bool,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn signal(&self) -> Option<i32> {
        self.status.and_then(|s| s.signal())
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// Short description of how the command ended, for diagnostics.
    pub fn describe_exit(&self) -> String {
        if self.timed_out {
            return format!("timed out after {:.1}s", self.elapsed.as_secs_f64());
        }
        match (self.exit_code(), self.signal()) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(sig)) => format!("killed by signal {}", sig),
            _ => "unknown exit status".to_string(),
        }
    }
}

/// Run `argv` to completion or until `opts.timeout`.
///
/// A missing executable is reported as [`BotError::InfrastructureUnavailable`].
pub fn run_bounded(argv: &[String], opts: &RunOptions<'_>) -> Result<RunOutcome> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| BotError::InfrastructureUnavailable("empty command line".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(cwd) = opts.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            BotError::InfrastructureUnavailable(format!("{} is not installed", program))
        }
        std::io::ErrorKind::PermissionDenied => {
            BotError::InfrastructureUnavailable(format!("{} is not executable", program))
        }
        _ => BotError::Io(e),
    })?;
    let pgid = child.id() as i32;
    debug!("Spawned {} (pgid {})", program, pgid);

    let (tx, rx) = crossbeam_channel::bounded::<Collected>(2);
    let mut readers = 0;
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        let limit = opts.limits.stdout_limit;
        thread::spawn(move || collect_stream(stdout, Stream::Stdout, limit, tx));
        readers += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        let limit = opts.limits.stderr_limit;
        thread::spawn(move || collect_stream(stderr, Stream::Stderr, limit, tx));
        readers += 1;
    }
    drop(tx);

    if let (Some(mut stdin), Some(data)) = (child.stdin.take(), opts.stdin) {
        let data = data.to_vec();
        // A child that never reads must not stall us; the writer ends with EPIPE.
        thread::spawn(move || {
            let _ = stdin.write_all(&data);
        });
    }

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                warn!("Waiting on {} failed: {}", program, e);
                break None;
            }
        }
        if start.elapsed() >= opts.timeout {
            timed_out = true;
            let outcome = terminate_group(pgid, KILL_GRACE, || {
                matches!(child.try_wait(), Ok(Some(_)))
            });
            debug!("Timed out {} terminated: {:?}", program, outcome);
            break child.try_wait().ok().flatten();
        }
        thread::sleep(Duration::from_millis(10));
    };

    // Leftover group members would hold the pipes open.
    if !timed_out {
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut truncated = false;
    let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
    for _ in 0..readers {
        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(collected) => {
                truncated |= collected.truncated;
                match collected.stream {
                    Stream::Stdout => stdout = collected.data,
                    Stream::Stderr => stderr = collected.data,
                }
            }
            Err(_) => {
                warn!("Output of {} not fully drained", program);
                break;
            }
        }
    }

    Ok(RunOutcome {
        status,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        timed_out,
        truncated,
        elapsed: start.elapsed(),
    })
}

/// Whether `program` resolves to an executable.
pub fn program_available(program: &str) -> bool {
    if program.contains('/') {
        return is_executable(Path::new(program));
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program))))
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
