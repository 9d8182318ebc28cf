//! Resource monitor: turns two counter snapshots into usage figures.

use crate::runtime::{ExecutionContext, StatsSnapshot};
use log::debug;
use serde::Serialize;
use std::time::Duration;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageSample {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    /// Relative to the ceiling; 0 when no ceiling is known
    pub memory_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom_kills: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_count: Option<u32>,
}

/// CPU time of the context as a share of host CPU time between two snapshots.
pub fn cpu_percent(pre: &StatsSnapshot, post: &StatsSnapshot) -> f64 {
    let cpu_delta = post.cpu_usage_usec as f64 - pre.cpu_usage_usec as f64;
    let system_delta = post.system_usage_usec as f64 - pre.system_usage_usec as f64;
    if system_delta <= 0.0 || cpu_delta < 0.0 {
        return 0.0;
    }
    cpu_delta / system_delta * 100.0
}

pub fn usage_from(pre: &StatsSnapshot, post: &StatsSnapshot, configured_limit: u64) -> UsageSample {
    let limit = post
        .memory_limit_bytes
        .filter(|l| *l > 0)
        .unwrap_or(configured_limit);
    let memory_percent = if limit == 0 {
        0.0
    } else {
        post.memory_bytes as f64 / limit as f64 * 100.0
    };
    UsageSample {
        cpu_percent: cpu_percent(pre, post),
        memory_mb: post.memory_bytes as f64 / BYTES_PER_MB,
        memory_percent,
        oom_kills: post.oom_kills,
        process_count: post.process_count,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceMonitor {
    window: Duration,
    memory_limit_bytes: u64,
}

impl ResourceMonitor {
    pub fn new(window: Duration, memory_limit_bytes: u64) -> Self {
        Self {
            window,
            memory_limit_bytes,
        }
    }

    /// Two snapshots `window` apart. Any failure yields `None`.
    pub fn sample(&self, context: &dyn ExecutionContext) -> Option<UsageSample> {
        let pre = match context.stats_snapshot() {
            Ok(s) => s,
            Err(e) => {
                debug!("No usage for {}: {}", context.reference(), e);
                return None;
            }
        };
        std::thread::sleep(self.window);
        let post = match context.stats_snapshot() {
            Ok(s) => s,
            Err(e) => {
                debug!("No usage for {}: {}", context.reference(), e);
                return None;
            }
        };
        Some(usage_from(&pre, &post, self.memory_limit_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(cpu: u64, system: u64) -> StatsSnapshot {
        StatsSnapshot {
            cpu_usage_usec: cpu,
            system_usage_usec: system,
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_percent_from_deltas() {
        assert_eq!(cpu_percent(&snap(100, 1000), &snap(150, 1200)), 25.0);
    }

    #[test]
    fn test_cpu_percent_guards_non_positive_denominator() {
        assert_eq!(cpu_percent(&snap(100, 1000), &snap(150, 1000)), 0.0);
        assert_eq!(cpu_percent(&snap(100, 1000), &snap(150, 900)), 0.0);
    }

    #[test]
    fn test_cgroup_events_come_from_latest_snapshot() {
        let pre = StatsSnapshot {
            oom_kills: Some(0),
            process_count: Some(3),
            ..snap(0, 0)
        };
        let post = StatsSnapshot {
            oom_kills: Some(2),
            process_count: Some(1),
            ..snap(0, 10)
        };
        let usage = usage_from(&pre, &post, 1);
        assert_eq!(usage.oom_kills, Some(2));
        assert_eq!(usage.process_count, Some(1));
    }

    #[test]
    fn test_memory_relative_to_ceiling() {
        let pre = snap(0, 0);
        let post = StatsSnapshot {
            memory_bytes: 128 * 1024 * 1024,
            memory_limit_bytes: Some(512 * 1024 * 1024),
            ..snap(0, 10)
        };
        let usage = usage_from(&pre, &post, 1);
        assert_eq!(usage.memory_mb, 128.0);
        assert_eq!(usage.memory_percent, 25.0);
        assert_eq!(usage.oom_kills, None);

        // Falls back to the configured ceiling.
        let unlimited = StatsSnapshot {
            memory_limit_bytes: None,
            ..post
        };
        let usage = usage_from(&pre, &unlimited, 256 * 1024 * 1024);
        assert_eq!(usage.memory_percent, 50.0);
    }
}
