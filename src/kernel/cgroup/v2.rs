/// Cgroup v2 backend implementation
use crate::config::types::{BotError, Result};
use crate::kernel::cgroup::backend::{cpu_max_line, CgroupBackend, CgroupCounters, CPU_PERIOD_USEC};
use std::fs;
use std::path::{Path, PathBuf};

fn cgroup_err(what: &str, path: &Path, e: impl std::fmt::Display) -> BotError {
    BotError::InfrastructureUnavailable(format!("{} ({}): {}", what, path.display(), e))
}

/// Cgroup v2 backend
pub struct CgroupV2 {
    base_path: PathBuf,
}

impl CgroupV2 {
    /// Prepare `base_path` as the parent of every bot cgroup.
    pub fn new(base_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_path)
            .map_err(|e| cgroup_err("Failed to create cgroup root", base_path, e))?;

        // Children only get controllers the parent delegates.
        let control = base_path.join("cgroup.subtree_control");
        if control.exists() {
            for controller in ["+memory", "+cpu", "+pids"] {
                if let Err(e) = fs::write(&control, controller) {
                    log::warn!("Could not enable {} under {}: {}", controller, base_path.display(), e);
                }
            }
        }

        Ok(CgroupV2 {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get cgroup path for instance
    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    /// Read accounting counters from any cgroup v2 directory.
    pub fn counters_at(path: &Path) -> Result<CgroupCounters> {
        let stat = fs::read_to_string(path.join("cpu.stat"))
            .map_err(|e| cgroup_err("Failed to read cpu.stat", path, e))?;
        let cpu_usage_usec = parse_keyed(&stat, "usage_usec").unwrap_or(0);

        let memory_current = read_u64(&path.join("memory.current"))?;
        let memory_max = match fs::read_to_string(path.join("memory.max")) {
            Ok(raw) => parse_limit(&raw),
            Err(_) => None,
        };
        let oom_kills = fs::read_to_string(path.join("memory.events"))
            .ok()
            .and_then(|events| parse_keyed(&events, "oom_kill"))
            .unwrap_or(0);
        let process_count = fs::read_to_string(path.join("pids.current"))
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0);

        Ok(CgroupCounters {
            cpu_usage_usec,
            memory_current,
            memory_max,
            oom_kills,
            process_count,
        })
    }
}

fn read_u64(path: &Path) -> Result<u64> {
    let raw = fs::read_to_string(path).map_err(|e| cgroup_err("Failed to read", path, e))?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| cgroup_err("Failed to parse", path, e))
}

/// `max` means unlimited.
fn parse_limit(raw: &str) -> Option<u64> {
    let value = raw.trim();
    if value == "max" {
        None
    } else {
        value.parse::<u64>().ok()
    }
}

/// Value of `key` in a flat-keyed file like `cpu.stat` or `memory.events`.
fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse::<u64>().ok(),
            _ => None,
        }
    })
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        fs::create_dir_all(&path).map_err(|e| cgroup_err("Failed to create cgroup", &path, e))?;

        // A bot's OOM takes down its whole tree rather than one random member.
        let oom_group_path = path.join("memory.oom.group");
        if oom_group_path.exists() {
            if let Err(e) = fs::write(&oom_group_path, "1") {
                log::warn!("Failed to set memory.oom.group for {}: {}", instance_id, e);
            }
        }
        Ok(())
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cgroup_err("Failed to remove cgroup", &path, e)),
        }
    }

    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()> {
        let path = self.instance_path(instance_id).join("cgroup.procs");
        fs::write(&path, pid.to_string())
            .map_err(|e| cgroup_err("Failed to attach process to cgroup", &path, e))
    }

    fn set_memory_limit(&self, instance_id: &str, limit_bytes: u64) -> Result<()> {
        let path = self.instance_path(instance_id).join("memory.max");
        fs::write(&path, limit_bytes.to_string())
            .map_err(|e| cgroup_err("Failed to set memory limit", &path, e))?;

        // No swap escape hatch around the ceiling.
        let swap = self.instance_path(instance_id).join("memory.swap.max");
        if swap.exists() {
            let _ = fs::write(&swap, "0");
        }
        Ok(())
    }

    fn set_process_limit(&self, instance_id: &str, limit: u32) -> Result<()> {
        let path = self.instance_path(instance_id).join("pids.max");
        fs::write(&path, limit.to_string())
            .map_err(|e| cgroup_err("Failed to set process limit", &path, e))
    }

    fn set_cpu_share(&self, instance_id: &str, share: f64) -> Result<()> {
        let path = self.instance_path(instance_id).join("cpu.max");
        fs::write(&path, cpu_max_line(share, CPU_PERIOD_USEC))
            .map_err(|e| cgroup_err("Failed to set CPU quota", &path, e))
    }

    fn read_counters(&self, instance_id: &str) -> Result<CgroupCounters> {
        Self::counters_at(&self.instance_path(instance_id))
    }

    fn kill_all(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        let kill_file = path.join("cgroup.kill");
        if kill_file.exists() {
            return fs::write(&kill_file, "1")
                .map_err(|e| cgroup_err("Failed to write cgroup.kill", &kill_file, e));
        }

        // Kernels before 5.14: signal members one by one.
        let procs = fs::read_to_string(path.join("cgroup.procs"))
            .map_err(|e| cgroup_err("Failed to read cgroup.procs", &path, e))?;
        for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        Ok(())
    }

    fn is_empty(&self, instance_id: &str) -> Result<bool> {
        let path = self.instance_path(instance_id).join("cgroup.procs");
        match fs::read_to_string(&path) {
            Ok(procs) => Ok(procs.trim().is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(cgroup_err("Failed to read cgroup.procs", &path, e)),
        }
    }

    fn cgroup_path(&self, instance_id: &str) -> PathBuf {
        self.instance_path(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_instance_path() {
        let root = fake_root();
        let cgroup = CgroupV2::new(root.path()).unwrap();
        assert_eq!(cgroup.cgroup_path("bot-7"), root.path().join("bot-7"));
    }

    #[test]
    fn test_limits_are_written_in_v2_format() {
        let root = fake_root();
        let cgroup = CgroupV2::new(root.path()).unwrap();
        cgroup.create("bot-1").unwrap();
        cgroup.set_memory_limit("bot-1", 512 * 1024 * 1024).unwrap();
        cgroup.set_cpu_share("bot-1", 0.5).unwrap();
        cgroup.set_process_limit("bot-1", 64).unwrap();

        let dir = root.path().join("bot-1");
        assert_eq!(fs::read_to_string(dir.join("memory.max")).unwrap(), "536870912");
        assert_eq!(fs::read_to_string(dir.join("cpu.max")).unwrap(), "50000 100000");
        assert_eq!(fs::read_to_string(dir.join("pids.max")).unwrap(), "64");
    }

    #[test]
    fn test_read_counters() {
        let root = fake_root();
        let dir = root.path().join("bot-2");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cpu.stat"), "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n").unwrap();
        fs::write(dir.join("memory.current"), "10485760\n").unwrap();
        fs::write(dir.join("memory.max"), "max\n").unwrap();
        fs::write(dir.join("memory.events"), "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n").unwrap();
        fs::write(dir.join("pids.current"), "4\n").unwrap();

        let counters = CgroupV2::counters_at(&dir).unwrap();
        assert_eq!(
            counters,
            CgroupCounters {
                cpu_usage_usec: 123456,
                memory_current: 10 * 1024 * 1024,
                memory_max: None,
                oom_kills: 1,
                process_count: 4,
            }
        );
    }

    #[test]
    fn test_missing_counters_fail() {
        let root = fake_root();
        assert!(CgroupV2::counters_at(&root.path().join("absent")).is_err());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let root = fake_root();
        let cgroup = CgroupV2::new(root.path()).unwrap();
        assert!(cgroup.remove("never-created").is_ok());
        assert!(cgroup.is_empty("never-created").unwrap());
    }
}
