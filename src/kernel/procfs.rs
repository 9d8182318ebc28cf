/// Read-only helpers over /proc
use std::fs;
use std::path::Path;

/// Columns of the `cpu` line that partition host time. `guest` and
/// `guest_nice` follow them and are already counted in `user` and `nice`.
const CPU_TIME_COLUMNS: usize = 8;

/// Total CPU time of the host in microseconds, from the aggregate `cpu` line
/// of `/proc/stat`.
pub fn system_cpu_usec() -> Option<u64> {
    let stat = fs::read_to_string("/proc/stat").ok()?;
    parse_system_cpu_usec(&stat, clock_ticks_per_sec())
}

fn clock_ticks_per_sec() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

pub(crate) fn parse_system_cpu_usec(stat: &str, ticks_per_sec: u64) -> Option<u64> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let ticks: u64 = line
        .split_whitespace()
        .skip(1)
        .take(CPU_TIME_COLUMNS)
        .filter_map(|v| v.parse::<u64>().ok())
        .sum();
    Some(ticks.saturating_mul(1_000_000) / ticks_per_sec.max(1))
}

/// Whether `pid` exists and is not a zombie.
pub fn process_alive(pid: u32) -> bool {
    match process_state(pid) {
        Some(state) => state != 'Z' && state != 'X',
        None => false,
    }
}

/// Single-letter scheduler state from `/proc/<pid>/stat`.
pub fn process_state(pid: u32) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parentheses; the state follows the last ')'.
    let after = &stat[stat.rfind(')')? + 1..];
    after.trim_start().chars().next()
}

/// Process group of `pid` from `/proc/<pid>/stat`.
pub fn process_group(pid: u32) -> Option<u32> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_process_group(&stat)
}

fn parse_process_group(stat: &str) -> Option<u32> {
    // Fields after comm: state, ppid, pgrp.
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().nth(2)?.parse().ok()
}

/// Live (non-zombie) members of process group `pgid`.
///
/// Unlike `killpg(pgid, 0)` this skips zombies, which still answer signals
/// until reaped.
pub fn group_members(pgid: u32) -> Vec<u32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| process_group(*pid) == Some(pgid) && process_alive(*pid))
        .collect()
}

/// NUL-separated command line of `pid`, split into arguments.
pub fn process_cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect(),
    )
}

/// cgroup v2 path of `pid` relative to the unified mount, e.g. `/system.slice/docker-<id>.scope`.
pub fn process_cgroup(pid: u32) -> Option<String> {
    let content = fs::read_to_string(format!("/proc/{}/cgroup", pid)).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|p| p.trim().to_string())
}

/// Number of online CPUs, used to bound CPU-share configuration.
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn procfs_available() -> bool {
    Path::new("/proc/self/stat").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_cpu_usec() {
        let stat = "cpu  100 0 50 800 30 0 20 0 0 0\ncpu0 50 0 25 400 15 0 10 0 0 0\n";
        assert_eq!(parse_system_cpu_usec(stat, 100), Some(10_000_000));
        // guest and guest_nice are already inside user and nice.
        let guests = "cpu  100 0 50 800 30 0 20 0 70 30\n";
        assert_eq!(parse_system_cpu_usec(guests, 100), Some(10_000_000));
        assert_eq!(parse_system_cpu_usec("intr 1 2 3", 100), None);
    }

    #[test]
    fn test_self_is_alive() {
        if !procfs_available() {
            return;
        }
        let me = std::process::id();
        assert!(process_alive(me));
        assert!(process_cmdline(me).map(|c| !c.is_empty()).unwrap_or(false));
        assert!(system_cpu_usec().unwrap_or(0) > 0);
    }

    #[test]
    fn test_parse_process_group_skips_comm() {
        let stat = "4242 (my (odd) bot) S 1 4240 4240 0 -1 4194560 100 0 0 0";
        assert_eq!(parse_process_group(stat), Some(4240));
        assert_eq!(parse_process_group("garbage"), None);
    }

    #[test]
    fn test_group_members_lists_live_processes_only() {
        use std::os::unix::process::CommandExt;
        if !procfs_available() {
            return;
        }
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = child.id();
        assert_eq!(group_members(pgid), vec![pgid]);
        child.kill().unwrap();
        // Unreaped, the child is a zombie and no longer counts.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !group_members(pgid).is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(group_members(pgid).is_empty());
        child.wait().unwrap();
    }

    #[test]
    fn test_missing_pid_is_dead() {
        assert!(!process_alive(u32::MAX - 1));
    }
}
