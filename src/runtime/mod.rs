//! Isolation runtimes
//!
//! An [`IsolationRuntime`] turns a [`LaunchSpec`] into a live, resource-bounded
//! [`ExecutionContext`]. Restart-on-crash belongs to the runtime: the launch spec carries
//! a declarative [`RestartPolicy`] and the supervisor never polls for crashes.
//!
//! Contexts are addressed by an opaque reference string so that a supervisor
//! process can find a context launched by an earlier one.

pub mod docker;
pub mod keeper;
pub mod native;

use crate::config::loader::{RuntimeKind, SupervisorConfig};
use crate::config::types::{BotId, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use docker::DockerRuntime;
pub use native::NativeRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Fraction of one core (0.5 = half a core)
    pub cpu_share: f64,
    pub process_limit: u32,
}

impl ResourceLimits {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            memory_bytes: config.memory_limit_bytes(),
            cpu_share: config.cpu_share,
            process_limit: config.process_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    Never,
    /// Restart after any exit until explicitly stopped
    UnlessStopped,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Runtime-unique instance name, derived from the bot id
    pub instance: String,
    /// Container image; ignored by runtimes that run on the host
    pub image: Option<String>,
    /// Program and arguments, relative to `working_dir`
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// Append-only sink that receives the program's output
    pub log_path: PathBuf,
    pub limits: ResourceLimits,
    pub restart: RestartPolicy,
    /// Grace the runtime itself grants its payload on shutdown
    pub stop_grace: Duration,
}

/// Raw counters from one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// CPU time consumed by the context
    pub cpu_usage_usec: u64,
    /// CPU time consumed by the whole host
    pub system_usage_usec: u64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: Option<u64>,
    /// Kills by the memory ceiling since the context started, when accounted
    pub oom_kills: Option<u64>,
    pub process_count: Option<u32>,
}

/// Handle to one live (or recently live) isolated process.
pub trait ExecutionContext: Send + Sync + Debug {
    /// Opaque reference accepted by [`IsolationRuntime::get_by_reference`].
    fn reference(&self) -> String;
    /// Whether the context still exists (running or restarting).
    fn is_present(&self) -> Result<bool>;
    /// Graceful termination, escalating after `grace`. A context that is already
    /// gone is not an error.
    fn stop(&self, grace: Duration) -> Result<()>;
    /// Release everything the context holds. Idempotent.
    fn remove(&self) -> Result<()>;
    fn logs(&self, tail_lines: usize) -> Result<String>;
    fn stats_snapshot(&self) -> Result<StatsSnapshot>;
}

pub trait IsolationRuntime: Send + Sync {
    fn name(&self) -> &str;
    /// Whether [`LaunchSpec::image`] is honored.
    fn uses_images(&self) -> bool;
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ExecutionContext>>;
    /// `Ok(None)` when the reference is unknown or belongs to another runtime.
    fn get_by_reference(&self, reference: &str) -> Result<Option<Arc<dyn ExecutionContext>>>;
}

pub fn instance_name(bot_id: BotId) -> String {
    format!("bot-{}", bot_id)
}

/// Build the runtime selected by configuration.
pub fn create_runtime(config: &SupervisorConfig) -> Result<Arc<dyn IsolationRuntime>> {
    match config.runtime {
        RuntimeKind::Native => Ok(Arc::new(NativeRuntime::from_config(config)?)),
        RuntimeKind::Docker => Ok(Arc::new(DockerRuntime::from_config(config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_follow_config() {
        let config = SupervisorConfig::default();
        let limits = ResourceLimits::from_config(&config);
        assert_eq!(limits.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(limits.cpu_share, 0.5);
    }

    #[test]
    fn test_restart_policy_wire_format() {
        let json = serde_json::to_string(&RestartPolicy::UnlessStopped).unwrap();
        assert_eq!(json, "\"unless_stopped\"");
    }
}
