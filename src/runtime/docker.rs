/// Container runtime driving the docker CLI
///
/// Containers are named `botbox-<instance>` and carry their log sink path as a
/// label, so a reference alone is enough to find everything again. The restart
/// policy maps onto docker's own `--restart`.
use crate::config::loader::SupervisorConfig;
use crate::config::types::{BotError, Result};
use crate::kernel::cgroup::backend::CGROUP_V2_MOUNT;
use crate::kernel::cgroup::CgroupV2;
use crate::kernel::procfs;
use crate::runtime::{ExecutionContext, IsolationRuntime, LaunchSpec, RestartPolicy, StatsSnapshot};
use crate::utils::output::OutputLimits;
use crate::utils::subprocess::{run_bounded, RunOptions, RunOutcome};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const REFERENCE_PREFIX: &str = "docker:";
const NAME_PREFIX: &str = "botbox-";
const LOG_LABEL: &str = "botbox.log";
const INSTANCE_LABEL: &str = "botbox.instance";
/// Mount point of the workspace inside the container
const CONTAINER_WORKDIR: &str = "/app";

/// `docker run` may pull the image.
const RUN_TIMEOUT: Duration = Duration::from_secs(300);
const CLI_TIMEOUT: Duration = Duration::from_secs(30);
/// Output flushed into the sink when a container is removed
const FLUSH_TAIL_LINES: usize = 500;

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: String,
}

/// What `docker inspect` tells us about one container.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Inspected {
    status: String,
    pid: u32,
    log_path: Option<PathBuf>,
}

impl DockerRuntime {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.docker_binary.clone())
    }

    fn context(&self, name: String, log_path: Option<PathBuf>) -> Arc<dyn ExecutionContext> {
        Arc::new(DockerContext {
            cli: DockerCli {
                docker: self.docker.clone(),
            },
            name,
            log_path,
        })
    }
}

pub fn container_name(instance: &str) -> String {
    format!("{}{}", NAME_PREFIX, instance)
}

fn restart_flag(policy: RestartPolicy) -> &'static str {
    match policy {
        RestartPolicy::Never => "no",
        RestartPolicy::UnlessStopped => "unless-stopped",
    }
}

/// Arguments of `docker run` for `spec`.
pub fn run_args(spec: &LaunchSpec, image: &str) -> Vec<String> {
    let name = container_name(&spec.instance);
    let memory = format!("{}b", spec.limits.memory_bytes);
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        name,
        "--restart".into(),
        restart_flag(spec.restart).into(),
        "--memory".into(),
        memory.clone(),
        // Equal to --memory: no swap on top of the ceiling.
        "--memory-swap".into(),
        memory,
        "--cpus".into(),
        format!("{:.2}", spec.limits.cpu_share),
        "--pids-limit".into(),
        spec.limits.process_limit.to_string(),
        "--stop-timeout".into(),
        spec.stop_grace.as_secs().max(1).to_string(),
        "-v".into(),
        format!("{}:{}", spec.working_dir.display(), CONTAINER_WORKDIR),
        "-w".into(),
        CONTAINER_WORKDIR.into(),
        "-e".into(),
        "PYTHONUNBUFFERED=1".into(),
        "--label".into(),
        format!("{}={}", INSTANCE_LABEL, spec.instance),
        "--label".into(),
        format!("{}={}", LOG_LABEL, spec.log_path.display()),
        image.into(),
    ];
    args.extend(spec.command.iter().cloned());
    args
}

fn valid_name(name: &str) -> bool {
    name.starts_with(NAME_PREFIX)
        && name.len() > NAME_PREFIX.len()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn no_such_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// Map a failed docker invocation onto the error taxonomy.
fn classify(outcome: &RunOutcome, what: &str, otherwise: fn(String) -> BotError) -> BotError {
    let detail = outcome.stderr.trim();
    if outcome.timed_out {
        return BotError::Timeout(format!("docker {} {}", what, outcome.describe_exit()));
    }
    if detail.contains("Cannot connect to the Docker daemon")
        || detail.contains("permission denied while trying to connect")
        || detail.contains("Is the docker daemon running")
    {
        return BotError::InfrastructureUnavailable(format!("docker daemon unreachable: {}", detail));
    }
    otherwise(format!("docker {} failed ({}): {}", what, outcome.describe_exit(), detail))
}

fn parse_inspect(line: &str) -> Option<Inspected> {
    let mut parts = line.trim().splitn(3, '|');
    let status = parts.next()?.to_string();
    let pid = parts.next()?.parse().ok()?;
    let log_path = parts
        .next()
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "<no value>")
        .map(PathBuf::from);
    Some(Inspected {
        status,
        pid,
        log_path,
    })
}

#[derive(Debug, Clone)]
struct DockerCli {
    docker: String,
}

impl DockerCli {
    fn run(&self, args: &[String], timeout: Duration) -> Result<RunOutcome> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.docker.clone());
        argv.extend(args.iter().cloned());
        let mut opts = RunOptions::with_timeout(timeout);
        opts.limits = OutputLimits {
            stdout_limit: 4 * 1024 * 1024,
            stderr_limit: 64 * 1024,
        };
        run_bounded(&argv, &opts)
    }

    fn inspect(&self, name: &str) -> Result<Option<Inspected>> {
        let format = format!(
            "{{{{.State.Status}}}}|{{{{.State.Pid}}}}|{{{{index .Config.Labels \"{}\"}}}}",
            LOG_LABEL
        );
        let outcome = self.run(
            &["inspect".into(), "--type".into(), "container".into(), "-f".into(), format, name.into()],
            CLI_TIMEOUT,
        )?;
        if !outcome.success() {
            if no_such_container(&outcome.stderr) {
                return Ok(None);
            }
            return Err(classify(&outcome, "inspect", BotError::InfrastructureUnavailable));
        }
        parse_inspect(&outcome.stdout).map(Some).ok_or_else(|| {
            BotError::InfrastructureUnavailable(format!(
                "unexpected docker inspect output: {}",
                outcome.stdout.trim()
            ))
        })
    }

    fn force_remove(&self, name: &str) -> Result<()> {
        let outcome = self.run(&["rm".into(), "-f".into(), name.into()], CLI_TIMEOUT)?;
        if outcome.success() || no_such_container(&outcome.stderr) {
            return Ok(());
        }
        Err(classify(&outcome, "rm", BotError::InfrastructureUnavailable))
    }
}

impl IsolationRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    fn uses_images(&self) -> bool {
        true
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ExecutionContext>> {
        let image = spec
            .image
            .as_deref()
            .ok_or_else(|| BotError::LaunchFailed("no image configured".to_string()))?;
        if !spec.working_dir.is_dir() {
            return Err(BotError::LaunchFailed(format!(
                "workspace {} is not readable",
                spec.working_dir.display()
            )));
        }
        let cli = DockerCli {
            docker: self.docker.clone(),
        };
        let name = container_name(&spec.instance);

        // The name must be free; a leftover would make `run` fail.
        cli.force_remove(&name)?;

        let outcome = cli.run(&run_args(spec, image), RUN_TIMEOUT)?;
        if !outcome.success() {
            let _ = cli.force_remove(&name);
            return Err(classify(&outcome, "run", BotError::LaunchFailed));
        }
        info!(
            "Launched container {} ({}) from {}",
            name,
            outcome.stdout.trim().chars().take(12).collect::<String>(),
            image
        );
        Ok(self.context(name, Some(spec.log_path.clone())))
    }

    fn get_by_reference(&self, reference: &str) -> Result<Option<Arc<dyn ExecutionContext>>> {
        let Some(name) = reference.strip_prefix(REFERENCE_PREFIX) else {
            return Ok(None);
        };
        if !valid_name(name) {
            return Ok(None);
        }
        let cli = DockerCli {
            docker: self.docker.clone(),
        };
        Ok(cli
            .inspect(name)?
            .map(|found| self.context(name.to_string(), found.log_path)))
    }
}

#[derive(Debug)]
pub struct DockerContext {
    cli: DockerCli,
    name: String,
    log_path: Option<PathBuf>,
}

impl DockerContext {
    fn flush_logs_to_sink(&self, sink: &Path) -> Result<()> {
        let outcome = self.cli.run(
            &[
                "logs".into(),
                "--tail".into(),
                FLUSH_TAIL_LINES.to_string(),
                self.name.clone(),
            ],
            CLI_TIMEOUT,
        )?;
        if !outcome.success() {
            return Ok(());
        }
        let mut file = OpenOptions::new().create(true).append(true).open(sink)?;
        file.write_all(outcome.stdout.as_bytes())?;
        file.write_all(outcome.stderr.as_bytes())?;
        Ok(())
    }
}

impl ExecutionContext for DockerContext {
    fn reference(&self) -> String {
        format!("{}{}", REFERENCE_PREFIX, self.name)
    }

    fn is_present(&self) -> Result<bool> {
        Ok(match self.cli.inspect(&self.name)? {
            Some(found) => matches!(
                found.status.as_str(),
                "running" | "restarting" | "paused" | "created"
            ),
            None => false,
        })
    }

    fn stop(&self, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        let outcome = self.cli.run(
            &["stop".into(), "-t".into(), secs, self.name.clone()],
            grace + CLI_TIMEOUT,
        )?;
        if outcome.success() || no_such_container(&outcome.stderr) {
            debug!("Container {} stopped", self.name);
            return Ok(());
        }
        Err(classify(&outcome, "stop", BotError::InfrastructureUnavailable))
    }

    fn remove(&self) -> Result<()> {
        if let Some(sink) = &self.log_path {
            if let Err(e) = self.flush_logs_to_sink(sink) {
                warn!("Could not keep final output of {}: {}", self.name, e);
            }
        }
        self.cli.force_remove(&self.name)
    }

    fn logs(&self, tail_lines: usize) -> Result<String> {
        let outcome = self.cli.run(
            &["logs".into(), "--tail".into(), tail_lines.to_string(), self.name.clone()],
            CLI_TIMEOUT,
        )?;
        if !outcome.success() {
            return Err(classify(&outcome, "logs", BotError::InfrastructureUnavailable));
        }
        // docker replays the container's stderr on ours.
        Ok(format!("{}{}", outcome.stdout, outcome.stderr))
    }

    fn stats_snapshot(&self) -> Result<StatsSnapshot> {
        let found = self
            .cli
            .inspect(&self.name)?
            .ok_or_else(|| BotError::NotFound(format!("container {}", self.name)))?;
        if found.pid == 0 {
            return Err(BotError::InfrastructureUnavailable(format!(
                "container {} has no running process",
                self.name
            )));
        }
        let relative = procfs::process_cgroup(found.pid).ok_or_else(|| {
            BotError::InfrastructureUnavailable(format!("no cgroup v2 entry for pid {}", found.pid))
        })?;
        let path = Path::new(CGROUP_V2_MOUNT).join(relative.trim_start_matches('/'));
        let counters = CgroupV2::counters_at(&path)?;
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
