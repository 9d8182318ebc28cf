/// Keeper process of the native runtime
///
/// The native runtime re-executes the botbox binary with `--internal-role keeper`.
/// The keeper reads one [`KeeperRequest`] as JSON on stdin, then runs the payload
/// with stdout and stderr inherited (both point at the bot's log sink) and applies
/// the restart policy itself. SIGTERM ends the loop: the payload gets the same
/// signal, a grace period, then SIGKILL.
use crate::config::types::{BotError, Result};
use crate::kernel::signal::{ignore_hangup, SignalHandler};
use crate::runtime::RestartPolicy;
use chrono::Utc;
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Exit code when the very first payload spawn fails.
pub const EXIT_SPAWN_FAILED: i32 = 3;
/// Exit code for an unreadable request.
pub const EXIT_BAD_REQUEST: i32 = 2;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// A run at least this long resets the backoff.
const HEALTHY_RUN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperRequest {
    pub instance: String,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub restart: RestartPolicy,
    pub stop_grace_ms: u64,
}

/// Exponential restart delay
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    initial: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
            initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum RunEnd {
    Exited(ExitStatus),
    Stopped,
}

fn marker(instance: &str, message: &str) {
    let line = format!(
        "[botbox {}] {}: {}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        instance,
        message
    );
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(line.as_bytes());
    let _ = err.flush();
}

fn describe(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(sig)) => format!("signal {}", sig),
        _ => "unknown status".to_string(),
    }
}

fn spawn_payload(req: &KeeperRequest) -> std::io::Result<Child> {
    let (program, args) = req
        .command
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;
    Command::new(program)
        .args(args)
        .current_dir(&req.working_dir)
        .stdin(Stdio::null())
        .env("PYTHONUNBUFFERED", "1")
        .spawn()
}

fn supervise(child: &mut Child, signals: &SignalHandler, grace: Duration) -> Result<RunEnd> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(RunEnd::Exited(status));
        }
        if signals.shutdown_requested() {
            shut_down_payload(child, grace);
            return Ok(RunEnd::Stopped);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn shut_down_payload(child: &mut Child, grace: Duration) {
    let pid = Pid::from_raw(child.id() as i32);
    // Usually already signalled through the process group.
    let _ = kill(pid, Signal::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    debug!("Payload {} outlived its grace period, killing", pid);
    let _ = child.kill();
    let _ = child.wait();
}

/// Entry point of the keeper role. Returns the process exit code.
pub fn run_keeper() -> Result<i32> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let req: KeeperRequest = match serde_json::from_str(&input) {
        Ok(req) => req,
        Err(e) => {
            marker("keeper", &format!("unreadable launch request: {}", e));
            return Ok(EXIT_BAD_REQUEST);
        }
    };

    let signals = SignalHandler::init().map_err(BotError::LaunchFailed)?;
    if let Err(e) = ignore_hangup() {
        warn!("{}", e);
    }
    let grace = Duration::from_millis(req.stop_grace_ms);
    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
    let mut first_run = true;

    loop {
        let started = Instant::now();
        let mut child = match spawn_payload(&req) {
            Ok(child) => child,
            Err(e) => {
                marker(&req.instance, &format!("failed to start {:?}: {}", req.command, e));
                if first_run || req.restart == RestartPolicy::Never {
                    return Ok(EXIT_SPAWN_FAILED);
                }
                if signals.wait_for_signal(backoff.next_delay()) {
                    return Ok(0);
                }
                continue;
            }
        };
        first_run = false;
        marker(&req.instance, &format!("started (pid {})", child.id()));

        let status = match supervise(&mut child, &signals, grace)? {
            RunEnd::Stopped => {
                marker(&req.instance, &format!("stopped by signal {}", signals.get_signal()));
                return Ok(0);
            }
            RunEnd::Exited(status) => status,
        };

        if req.restart == RestartPolicy::Never {
            marker(&req.instance, &format!("exited with {}", describe(&status)));
            return Ok(status.code().unwrap_or(1));
        }
        if started.elapsed() >= HEALTHY_RUN {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        marker(
            &req.instance,
            &format!("exited with {}, restarting in {}s", describe(&status), delay.as_secs()),
        );
        if signals.wait_for_signal(delay) {
            marker(&req.instance, &format!("stopped by signal {}", signals.get_signal()));
            return Ok(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_request_round_trips_through_json() {
        let req = KeeperRequest {
            instance: "bot-4".to_string(),
            command: vec!["python3".into(), "-u".into(), "bot.py".into()],
            working_dir: PathBuf::from("/srv/bots/user_1/bot_4"),
            restart: RestartPolicy::UnlessStopped,
            stop_grace_ms: 5000,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"unless_stopped\""));
        let back: KeeperRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command, req.command);
    }
}
