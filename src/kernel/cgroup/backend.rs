//! Cgroup backend abstraction.

use crate::config::types::Result;
use std::path::{Path, PathBuf};

/// Default `cpu.max` period in microseconds.
pub const CPU_PERIOD_USEC: u64 = 100_000;

/// Raw accounting counters of one cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupCounters {
    /// Cumulative CPU time (`cpu.stat` usage_usec)
    pub cpu_usage_usec: u64,
    /// Current memory charge in bytes
    pub memory_current: u64,
    /// Configured ceiling, `None` when unlimited
    pub memory_max: Option<u64>,
    pub oom_kills: u64,
    pub process_count: u32,
}

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    fn create(&self, instance_id: &str) -> Result<()>;
    /// Remove an empty cgroup. Missing cgroups are not an error.
    fn remove(&self, instance_id: &str) -> Result<()>;
    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()>;
    fn set_memory_limit(&self, instance_id: &str, limit_bytes: u64) -> Result<()>;
    fn set_process_limit(&self, instance_id: &str, limit: u32) -> Result<()>;
    /// Hard CPU ceiling as a fraction of one core.
    fn set_cpu_share(&self, instance_id: &str, share: f64) -> Result<()>;
    fn read_counters(&self, instance_id: &str) -> Result<CgroupCounters>;
    /// SIGKILL every member.
    fn kill_all(&self, instance_id: &str) -> Result<()>;
    fn is_empty(&self, instance_id: &str) -> Result<bool>;
    fn cgroup_path(&self, instance_id: &str) -> PathBuf;
}

/// Unified hierarchy mount point.
pub const CGROUP_V2_MOUNT: &str = "/sys/fs/cgroup";

pub fn detect_cgroup_v2() -> bool {
    Path::new(CGROUP_V2_MOUNT).join("cgroup.controllers").exists()
}

/// cgroup v2 backend rooted at `root`, or `None` when the host has no unified
/// hierarchy or `root` cannot be prepared.
pub fn create_cgroup_backend(root: &Path) -> Option<Box<dyn CgroupBackend>> {
    if !detect_cgroup_v2() {
        log::warn!("cgroup v2 not available, resource limits will not be enforced");
        return None;
    }
    match crate::kernel::cgroup::v2::CgroupV2::new(root) {
        Ok(backend) => {
            log::info!("Using cgroup v2 backend at {}", root.display());
            Some(Box::new(backend))
        }
        Err(e) => {
            log::warn!(
                "cgroup v2 root {} unusable ({}), resource limits will not be enforced",
                root.display(),
                e
            );
            None
        }
    }
}

/// `cpu.max` line for a share of one core.
pub fn cpu_max_line(share: f64, period_usec: u64) -> String {
    if share <= 0.0 {
        return format!("max {}", period_usec);
    }
    let quota = ((share * period_usec as f64).round() as u64).max(1000);
    format!("{} {}", quota, period_usec)
}
