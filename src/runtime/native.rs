/// Native isolation runtime
///
/// Each context is a keeper process (this binary, re-executed with
/// `--internal-role keeper`) leading its own process group and placed in a
/// per-instance cgroup v2 before it is told what to run. The payload inherits
/// group and cgroup, so a group signal plus `cgroup.kill` reaches everything the
/// bot spawned.
///
/// Instance records live under `<root>/.runtime/<instance>.json`; a supervisor
/// that restarts finds its contexts again through them.
use crate::config::loader::SupervisorConfig;
use crate::config::types::{BotError, Result};
use crate::kernel::cgroup::{create_cgroup_backend, CgroupBackend};
use crate::kernel::procfs;
use crate::kernel::signal::terminate_group;
use crate::runtime::keeper::KeeperRequest;
use crate::runtime::{ExecutionContext, IsolationRuntime, LaunchSpec, ResourceLimits, StatsSnapshot};
use crate::utils::atomic::atomic_write;
use crate::utils::output::tail_file;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const REFERENCE_PREFIX: &str = "native:";
const STATE_DIR: &str = ".runtime";
/// How long a fresh keeper is watched for an immediate failure.
const STARTUP_PROBE: Duration = Duration::from_millis(300);
const LOG_TAIL_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceRecord {
    instance: String,
    /// Keeper pid, also its process group id
    pid: u32,
    log_path: PathBuf,
    limits: ResourceLimits,
    cgroup: Option<PathBuf>,
    started_at: DateTime<Utc>,
}

type ChildTable = Arc<Mutex<HashMap<String, Child>>>;

/// State shared between the runtime and the contexts it hands out.
struct Shared {
    state_dir: PathBuf,
    cgroups: Option<Arc<dyn CgroupBackend>>,
    /// Keepers spawned by this process, kept so they get reaped
    children: ChildTable,
}

pub struct NativeRuntime {
    keeper_program: PathBuf,
    shared: Arc<Shared>,
}

impl NativeRuntime {
    pub fn new(
        root: &Path,
        keeper_program: PathBuf,
        cgroups: Option<Box<dyn CgroupBackend>>,
    ) -> Result<Self> {
        let state_dir = root.join(STATE_DIR);
        fs::create_dir_all(&state_dir).map_err(|e| {
            BotError::InfrastructureUnavailable(format!(
                "cannot create {}: {}",
                state_dir.display(),
                e
            ))
        })?;
        if cgroups.is_none() {
            warn!("Native runtime without cgroup v2: memory and CPU ceilings are not enforced");
        }
        Ok(Self {
            keeper_program,
            shared: Arc::new(Shared {
                state_dir,
                cgroups: cgroups.map(Arc::from),
                children: Arc::new(Mutex::new(HashMap::new())),
            }),
        })
    }

    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| {
            BotError::InfrastructureUnavailable(format!("cannot locate own executable: {}", e))
        })?;
        Self::new(&config.root_dir, program, create_cgroup_backend(&config.cgroup_root))
    }

    pub fn limits_enforced(&self) -> bool {
        self.shared.cgroups.is_some()
    }

    fn context(&self, record: InstanceRecord) -> Arc<dyn ExecutionContext> {
        Arc::new(NativeContext {
            record,
            shared: Arc::clone(&self.shared),
        })
    }

    fn apply_cgroup(&self, spec: &LaunchSpec, pid: u32) -> Result<Option<PathBuf>> {
        let Some(cg) = &self.shared.cgroups else {
            return Ok(None);
        };
        cg.create(&spec.instance)?;
        cg.set_memory_limit(&spec.instance, spec.limits.memory_bytes)?;
        cg.set_cpu_share(&spec.instance, spec.limits.cpu_share)?;
        cg.set_process_limit(&spec.instance, spec.limits.process_limit)?;
        cg.attach_process(&spec.instance, pid)?;
        Ok(Some(cg.cgroup_path(&spec.instance)))
    }

    fn abort_launch(&self, spec: &LaunchSpec, mut child: Child) {
        let _ = child.kill();
        let _ = child.wait();
        if let Some(cg) = &self.shared.cgroups {
            let _ = cg.kill_all(&spec.instance);
            let _ = cg.remove(&spec.instance);
        }
    }
}

fn state_path(state_dir: &Path, instance: &str) -> PathBuf {
    state_dir.join(format!("{}.json", instance))
}

fn read_record(path: &Path) -> Result<Option<InstanceRecord>> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
            BotError::InfrastructureUnavailable(format!(
                "unreadable instance record {}: {}",
                path.display(),
                e
            ))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn launch_err(e: std::io::Error, what: &str) -> BotError {
    match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            BotError::InfrastructureUnavailable(format!("{}: {}", what, e))
        }
        _ => BotError::LaunchFailed(format!("{}: {}", what, e)),
    }
}

impl IsolationRuntime for NativeRuntime {
    fn name(&self) -> &str {
        "native"
    }

    fn uses_images(&self) -> bool {
        false
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ExecutionContext>> {
        if spec.command.is_empty() {
            return Err(BotError::LaunchFailed("empty command".to_string()));
        }
        if !spec.working_dir.is_dir() {
            return Err(BotError::LaunchFailed(format!(
                "workspace {} is not readable",
                spec.working_dir.display()
            )));
        }

        // A leftover context of the same instance would share its cgroup.
        let state_file = state_path(&self.shared.state_dir, &spec.instance);
        if let Some(stale) = read_record(&state_file)? {
            warn!("Replacing leftover context {} (pid {})", stale.instance, stale.pid);
            let ctx = NativeContext {
                record: stale,
                shared: Arc::clone(&self.shared),
            };
            ctx.stop(Duration::ZERO)?;
            ctx.remove()?;
        }

        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(|e| launch_err(e, "cannot open log sink"))?;
        let sink_err = sink.try_clone()?;

        let mut child = Command::new(&self.keeper_program)
            .args(["--internal-role", "keeper", "--instance", &spec.instance])
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::from(sink_err))
            .process_group(0)
            .spawn()
            .map_err(|e| launch_err(e, "cannot start keeper"))?;
        let pid = child.id();

        let cgroup = match self.apply_cgroup(spec, pid) {
            Ok(path) => path,
            Err(e) => {
                self.abort_launch(spec, child);
                return Err(e);
            }
        };

        let request = KeeperRequest {
            instance: spec.instance.clone(),
            command: spec.command.clone(),
            working_dir: spec.working_dir.clone(),
            restart: spec.restart,
            stop_grace_ms: spec.stop_grace.as_millis() as u64,
        };
        let handed_over = serde_json::to_vec(&request)
            .map_err(std::io::Error::other)
            .and_then(|payload| match child.stdin.take() {
                Some(mut stdin) => stdin.write_all(&payload),
                None => Err(std::io::Error::other("keeper stdin not captured")),
            });
        if let Err(e) = handed_over {
            self.abort_launch(spec, child);
            return Err(BotError::LaunchFailed(format!("cannot hand request to keeper: {}", e)));
        }

        let probe_end = Instant::now() + STARTUP_PROBE;
        while Instant::now() < probe_end {
            if let Some(status) = child.try_wait()? {
                if let Some(cg) = &self.shared.cgroups {
                    let _ = cg.remove(&spec.instance);
                }
                let tail = tail_file(&spec.log_path, 5, LOG_TAIL_BYTES).unwrap_or_default();
                return Err(BotError::LaunchFailed(format!(
                    "{} exited during startup ({}): {}",
                    spec.instance,
                    status,
                    tail.trim()
                )));
            }
            std::thread::sleep(Duration::from_millis(25));
        }

        let record = InstanceRecord {
            instance: spec.instance.clone(),
            pid,
            log_path: spec.log_path.clone(),
            limits: spec.limits,
            cgroup,
            started_at: Utc::now(),
        };
        let encoded = serde_json::to_vec_pretty(&record).map_err(std::io::Error::other)?;
        if let Err(e) = atomic_write(&state_file, &encoded) {
            self.abort_launch(spec, child);
            return Err(BotError::LaunchFailed(format!(
                "cannot record instance {}: {}",
                spec.instance, e
            )));
        }

        if let Ok(mut children) = self.shared.children.lock() {
            children.insert(spec.instance.clone(), child);
        }
        info!(
            "Launched {} (keeper pid {}, limits {} bytes / {} cpu / {} pids{})",
            spec.instance,
            pid,
            spec.limits.memory_bytes,
            spec.limits.cpu_share,
            spec.limits.process_limit,
            if self.limits_enforced() { "" } else { ", not enforced" }
        );
        Ok(self.context(record))
    }

    fn get_by_reference(&self, reference: &str) -> Result<Option<Arc<dyn ExecutionContext>>> {
        let Some(instance) = reference.strip_prefix(REFERENCE_PREFIX) else {
            return Ok(None);
        };
        if instance.is_empty() || instance.contains('/') {
            return Ok(None);
        }
        let record = read_record(&state_path(&self.shared.state_dir, instance))?;
        Ok(record.map(|r| self.context(r)))
    }
}

pub struct NativeContext {
    record: InstanceRecord,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeContext")
            .field("instance", &self.record.instance)
            .field("pid", &self.record.pid)
            .finish()
    }
}

impl NativeContext {
    /// `Some(exited)` when this process spawned the keeper.
    fn poll_own_child(&self) -> Option<bool> {
        let mut children = self.shared.children.lock().ok()?;
        let child = children.get_mut(&self.record.instance)?;
        match child.try_wait() {
            Ok(None) => Some(false),
            Ok(Some(_)) | Err(_) => {
                children.remove(&self.record.instance);
                Some(true)
            }
        }
    }

    fn keeper_alive(&self) -> bool {
        if let Some(exited) = self.poll_own_child() {
            return !exited;
        }
        let pid = self.record.pid;
        if !procfs::process_alive(pid) {
            return false;
        }
        // Guard against pid reuse.
        procfs::process_cmdline(pid)
            .map(|argv| argv.iter().any(|a| a == &self.record.instance) && argv.iter().any(|a| a == "keeper"))
            .unwrap_or(false)
    }

    /// A keeper killed outright leaves its payload running in the keeper's
    /// process group.
    fn group_alive(&self) -> bool {
        // Kernel threads sit in group 0.
        self.record.pid > 1 && !procfs::group_members(self.record.pid).is_empty()
    }
}

impl ExecutionContext for NativeContext {
    fn reference(&self) -> String {
        format!("{}{}", REFERENCE_PREFIX, self.record.instance)
    }

    fn is_present(&self) -> Result<bool> {
        if self.keeper_alive() || self.group_alive() {
            return Ok(true);
        }
        match &self.shared.cgroups {
            Some(cg) => Ok(!cg.is_empty(&self.record.instance).unwrap_or(true)),
            None => Ok(false),
        }
    }

    fn stop(&self, grace: Duration) -> Result<()> {
        let keeper_alive = self.keeper_alive();
        if keeper_alive || self.group_alive() {
            if !keeper_alive {
                warn!("Payload of {} outlived its keeper, stopping it", self.record.instance);
            }
            let outcome = terminate_group(self.record.pid as i32, grace, || {
                !self.keeper_alive() && !self.group_alive()
            });
            debug!("Process group of {} terminated: {:?}", self.record.instance, outcome);
        }
        if let Some(cg) = &self.shared.cgroups {
            if !cg.is_empty(&self.record.instance).unwrap_or(true) {
                cg.kill_all(&self.record.instance)?;
            }
        }
        if let Ok(mut children) = self.shared.children.lock() {
            if let Some(mut child) = children.remove(&self.record.instance) {
                let _ = child.wait();
            }
        }
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        if self.keeper_alive() || self.group_alive() {
            self.stop(Duration::ZERO)?;
        }
        if let Some(cg) = &self.shared.cgroups {
            let mut attempts = 0;
            loop {
                match cg.remove(&self.record.instance) {
                    Ok(()) => break,
                    // Members may take a moment to leave after cgroup.kill.
                    Err(e) if attempts < 20 => {
                        attempts += 1;
                        debug!("cgroup of {} not yet removable: {}", self.record.instance, e);
                        let _ = cg.kill_all(&self.record.instance);
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        match fs::remove_file(state_path(&self.shared.state_dir, &self.record.instance)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn logs(&self, tail_lines: usize) -> Result<String> {
        Ok(tail_file(&self.record.log_path, tail_lines, LOG_TAIL_BYTES)?)
    }

    fn stats_snapshot(&self) -> Result<StatsSnapshot> {
        let cg = self.shared.cgroups.as_ref().ok_or_else(|| {
            BotError::InfrastructureUnavailable("usage is not accounted without cgroup v2".to_string())
        })?;
        let counters = cg.read_counters(&self.record.instance)?;
        let system_usage_usec = procfs::system_cpu_usec().ok_or_else(|| {
            BotError::InfrastructureUnavailable("cannot read /proc/stat".to_string())
        })?;
        Ok(StatsSnapshot {
            cpu_usage_usec: counters.cpu_usage_usec,
            system_usage_usec,
            memory_bytes: counters.memory_current,
            memory_limit_bytes: counters.memory_max,
            oom_kills: Some(counters.oom_kills),
            process_count: Some(counters.process_count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_references_resolve_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = NativeRuntime::new(dir.path(), PathBuf::from("/nonexistent"), None).unwrap();
        assert!(runtime.get_by_reference("docker:botbox-bot-1").unwrap().is_none());
        assert!(runtime.get_by_reference("native:bot-1").unwrap().is_none());
        assert!(runtime.get_by_reference("native:../etc").unwrap().is_none());
    }

    #[test]
    fn test_record_is_found_and_stale_context_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = NativeRuntime::new(dir.path(), PathBuf::from("/nonexistent"), None).unwrap();
        let mut exited = Command::new("true").spawn().unwrap();
        let dead_pid = exited.id();
        exited.wait().unwrap();
        let record = InstanceRecord {
            instance: "bot-9".to_string(),
            pid: dead_pid,
            log_path: dir.path().join("bot.log"),
            limits: ResourceLimits {
                memory_bytes: 1 << 20,
                cpu_share: 0.5,
                process_limit: 8,
            },
            cgroup: None,
            started_at: Utc::now(),
        };
        let path = state_path(&dir.path().join(STATE_DIR), "bot-9");
        atomic_write(&path, &serde_json::to_vec(&record).unwrap()).unwrap();

        let ctx = runtime.get_by_reference("native:bot-9").unwrap().unwrap();
        assert_eq!(ctx.reference(), "native:bot-9");
        assert!(!ctx.is_present().unwrap());
        ctx.stop(Duration::from_millis(10)).unwrap();
        ctx.remove().unwrap();
        assert!(!path.exists());
        assert!(runtime.get_by_reference("native:bot-9").unwrap().is_none());
    }

    #[test]
    fn test_payload_outliving_its_keeper_is_present_until_stopped() {
        if !procfs::procfs_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let runtime = NativeRuntime::new(dir.path(), PathBuf::from("/nonexistent"), None).unwrap();
        // The group leader exits at once and leaves a member behind, like a
        // keeper that was SIGKILLed under its payload.
        let spawned = Command::new("sh")
            .args(["-c", "sleep 30 >/dev/null 2>&1 & echo $!"])
            .process_group(0)
            .output()
            .unwrap();
        let orphan_pid = String::from_utf8_lossy(&spawned.stdout).trim().parse::<u32>().unwrap();
        let orphan_pgid = procfs::process_group(orphan_pid).unwrap();
        assert!(procfs::process_alive(orphan_pid));

        let ctx = runtime.context(InstanceRecord {
            instance: "bot-5".to_string(),
            pid: orphan_pgid,
            log_path: dir.path().join("bot.log"),
            limits: ResourceLimits {
                memory_bytes: 1 << 20,
                cpu_share: 0.5,
                process_limit: 8,
            },
            cgroup: None,
            started_at: Utc::now(),
        });
        assert!(ctx.is_present().unwrap());

        ctx.stop(Duration::from_millis(500)).unwrap();
        assert!(!procfs::process_alive(orphan_pid));
        assert!(!ctx.is_present().unwrap());
        ctx.remove().unwrap();
    }

    #[test]
    fn test_missing_keeper_is_infrastructure_error() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("ws");
        fs::create_dir_all(&ws).unwrap();
        let runtime = NativeRuntime::new(dir.path(), PathBuf::from("/nonexistent/botbox"), None).unwrap();
        let spec = LaunchSpec {
            instance: "bot-1".to_string(),
            image: None,
            command: vec!["python3".into(), "bot.py".into()],
            working_dir: ws.clone(),
            log_path: ws.join(".botbox.log"),
            limits: ResourceLimits {
                memory_bytes: 1 << 20,
                cpu_share: 0.5,
                process_limit: 8,
            },
            restart: crate::runtime::RestartPolicy::UnlessStopped,
            stop_grace: Duration::from_millis(100),
        };
        let err = runtime.launch(&spec).unwrap_err();
        assert!(matches!(err, BotError::InfrastructureUnavailable(_)));
    }

    #[test]
    fn test_stats_unavailable_without_cgroups() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = NativeRuntime::new(dir.path(), PathBuf::from("/nonexistent"), None).unwrap();
        let ctx = runtime.context(InstanceRecord {
            instance: "bot-2".to_string(),
            pid: 0,
            log_path: dir.path().join("bot.log"),
            limits: ResourceLimits {
                memory_bytes: 1,
                cpu_share: 0.1,
                process_limit: 1,
            },
            cgroup: None,
            started_at: Utc::now(),
        });
        assert!(matches!(
            ctx.stats_snapshot(),
            Err(BotError::InfrastructureUnavailable(_))
        ));
        assert_eq!(ctx.logs(10).unwrap(), "");
    }
}
