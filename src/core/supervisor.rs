/// Bot lifecycle supervisor
///
/// Public entry points authorize the caller once (owner or admin, never
/// banned), take the per-bot lock, and only then touch the store, the
/// workspace or the runtime. Everything that can go wrong comes back as a
/// [`BotError`]; only store faults are fatal.
///
/// The supervisor never polls for crashes. Restart-on-exit is delegated to the
/// runtime through the launch policy; a `running` record whose context has
/// vanished is corrected to `stopped` the next time anyone looks at it.
use crate::config::loader::SupervisorConfig;
use crate::config::types::{
    BotError, BotId, BotRecord, BotState, DependencyRecord, LogEntry, Result, Severity, UserId,
    UserRecord,
};
use crate::core::handles::HandleTable;
use crate::core::types::{Actor, UploadReport};
use crate::install::{DependencyInstaller, InstallReport};
use crate::lang::Language;
use crate::monitor::{ResourceMonitor, UsageSample};
use crate::observability::metrics::{get_metrics, MetricsRegistry};
use crate::runtime::{
    create_runtime, instance_name, ExecutionContext, IsolationRuntime, LaunchSpec, ResourceLimits,
    RestartPolicy,
};
use crate::safety::lock_manager::{BotLockGuard, BotLockManager};
use crate::safety::workspace::{FsWorkspaceAllocator, StagedUpload, WorkspaceAllocator};
use crate::store::{JsonFileStore, MetadataStore};
use crate::utils::output::{tail_file, truncate_for_display};
use crate::validate::{extract_dependencies, StaticValidator, ValidationResult};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LOCK_DIR: &str = ".locks";
const SINK_TAIL_BYTES: u64 = 1024 * 1024;

pub struct BotSupervisor {
    config: SupervisorConfig,
    store: Arc<dyn MetadataStore>,
    runtime: Arc<dyn IsolationRuntime>,
    workspaces: Arc<dyn WorkspaceAllocator>,
    validator: StaticValidator,
    installer: DependencyInstaller,
    monitor: ResourceMonitor,
    locks: BotLockManager,
    handles: HandleTable,
    metrics: Arc<MetricsRegistry>,
}

impl BotSupervisor {
    /// Supervisor over the JSON store and runtime named in `config`,
    /// reporting into the process-wide metrics registry.
    pub fn from_config(config: SupervisorConfig) -> Result<Self> {
        let store = Arc::new(JsonFileStore::open(&config.store_path)?);
        let runtime = create_runtime(&config)?;
        Ok(Self::new(config, store, runtime)?.with_metrics(get_metrics()))
    }

    pub fn new(
        config: SupervisorConfig,
        store: Arc<dyn MetadataStore>,
        runtime: Arc<dyn IsolationRuntime>,
    ) -> Result<Self> {
        let workspaces = Arc::new(FsWorkspaceAllocator::new(
            &config.root_dir,
            config.workspace_limits(),
        )?);
        Self::with_workspaces(config, store, runtime, workspaces)
    }

    pub fn with_workspaces(
        config: SupervisorConfig,
        store: Arc<dyn MetadataStore>,
        runtime: Arc<dyn IsolationRuntime>,
        workspaces: Arc<dyn WorkspaceAllocator>,
    ) -> Result<Self> {
        let locks = BotLockManager::new(workspaces.root().join(LOCK_DIR))?;
        Ok(Self {
            validator: StaticValidator::from_config(&config),
            installer: DependencyInstaller::from_config(&config),
            monitor: ResourceMonitor::new(config.sample_window(), config.memory_limit_bytes()),
            config,
            store,
            runtime,
            workspaces,
            locks,
            handles: HandleTable::new(),
            metrics: Arc::new(MetricsRegistry::new()),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Parse-only check of a candidate source; nothing is stored.
    pub fn validate_source(&self, source: &str, language: Language) -> ValidationResult {
        self.validator.validate(source, language)
    }

    // ---- uploads -------------------------------------------------------

    pub fn upload(&self, actor: &Actor, filename: &str, bytes: &[u8]) -> Result<UploadReport> {
        let result = self.do_upload(actor, filename, bytes);
        self.tracked("upload", None, result)
    }

    /// Replace the artifact of a bot that is not running. The workspace is
    /// rebuilt from the upload, so packages from `install` have to be
    /// installed again; the history notes which.
    pub fn reupload(&self, actor: &Actor, bot_id: BotId, filename: &str, bytes: &[u8]) -> Result<UploadReport> {
        let result = self.do_reupload(actor, bot_id, filename, bytes);
        self.tracked("reupload", Some(bot_id), result)
    }

    // ---- lifecycle -----------------------------------------------------

    pub fn start(&self, actor: &Actor, bot_id: BotId) -> Result<BotRecord> {
        let result = self.do_start(actor, bot_id);
        self.tracked("start", Some(bot_id), result)
    }

    pub fn stop(&self, actor: &Actor, bot_id: BotId) -> Result<BotRecord> {
        let result = self.do_stop(actor, bot_id);
        self.tracked("stop", Some(bot_id), result)
    }

    pub fn restart(&self, actor: &Actor, bot_id: BotId) -> Result<BotRecord> {
        let result = self.do_restart(actor, bot_id);
        self.tracked("restart", Some(bot_id), result)
    }

    pub fn delete(&self, actor: &Actor, bot_id: BotId) -> Result<()> {
        let result = self.do_delete(actor, bot_id);
        self.tracked("delete", Some(bot_id), result)
    }

    // ---- queries -------------------------------------------------------

    /// Current record, reconciled with the runtime.
    pub fn status(&self, actor: &Actor, bot_id: BotId) -> Result<BotRecord> {
        let result = (|| {
            let _guard = self.lock(bot_id)?;
            let bot = self.load_authorized(actor, bot_id)?;
            self.reconcile(bot)
        })();
        self.tracked("status", Some(bot_id), result)
    }

    pub fn list_bots(&self, actor: &Actor) -> Result<Vec<BotRecord>> {
        let result = (|| {
            self.check_not_banned(actor)?;
            let bots = self.store.list_bots_for_user(actor.user_id)?;
            Ok(self.reconcile_listing(bots))
        })();
        self.tracked("list", None, result)
    }

    pub fn list_all_bots(&self, actor: &Actor) -> Result<Vec<BotRecord>> {
        let result = (|| {
            self.require_admin(actor)?;
            let bots = self.store.list_all_bots()?;
            Ok(self.reconcile_listing(bots))
        })();
        self.tracked("list_all", None, result)
    }

    pub fn list_users(&self, actor: &Actor) -> Result<Vec<UserRecord>> {
        let result = self
            .require_admin(actor)
            .and_then(|_| self.store.list_all_users());
        self.tracked("list_users", None, result)
    }

    /// Recent program output, most recent characters kept.
    pub fn logs(&self, actor: &Actor, bot_id: BotId, tail_lines: Option<usize>) -> Result<String> {
        let result = self.do_logs(actor, bot_id, tail_lines);
        self.tracked("logs", Some(bot_id), result)
    }

    /// `None` when the bot is not running or usage cannot be sampled.
    pub fn stats(&self, actor: &Actor, bot_id: BotId) -> Result<Option<UsageSample>> {
        let result = self.do_stats(actor, bot_id);
        self.tracked("stats", Some(bot_id), result)
    }

    pub fn history(&self, actor: &Actor, bot_id: BotId, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let result = self.load_authorized(actor, bot_id).and_then(|_| {
            self.store
                .list_logs(bot_id, limit.unwrap_or(self.config.history_limit))
        });
        self.tracked("history", Some(bot_id), result)
    }

    // ---- dependencies --------------------------------------------------

    pub fn install(&self, actor: &Actor, bot_id: BotId, package: &str) -> Result<InstallReport> {
        let result = self.do_install(actor, bot_id, package);
        self.tracked("install", Some(bot_id), result)
    }

    pub fn dependencies(&self, actor: &Actor, bot_id: BotId) -> Result<Vec<DependencyRecord>> {
        let result = self
            .load_authorized(actor, bot_id)
            .and_then(|_| self.store.list_dependencies(bot_id));
        self.tracked("dependencies", Some(bot_id), result)
    }

    // ---- administration ------------------------------------------------

    pub fn ban_user(&self, actor: &Actor, user_id: UserId) -> Result<()> {
        let result = self.require_admin(actor).and_then(|_| {
            if self.config.is_admin(user_id) {
                return Err(BotError::InvalidState("administrators cannot be banned".to_string()));
            }
            self.store.set_banned(user_id, true)?;
            info!("User {} banned by {}", user_id, actor.user_id);
            Ok(())
        });
        self.tracked("ban", None, result)
    }

    pub fn unban_user(&self, actor: &Actor, user_id: UserId) -> Result<()> {
        let result = self.require_admin(actor).and_then(|_| {
            self.store.set_banned(user_id, false)?;
            info!("User {} unbanned by {}", user_id, actor.user_id);
            Ok(())
        });
        self.tracked("unban", None, result)
    }

    pub fn set_premium(&self, actor: &Actor, user_id: UserId, premium: bool) -> Result<()> {
        let result = self
            .require_admin(actor)
            .and_then(|_| self.store.set_premium(user_id, premium));
        self.tracked("set_premium", None, result)
    }

    /// Prometheus text for the lifecycle counters, with the running gauge
    /// refreshed from the store.
    pub fn export_metrics(&self) -> Result<String> {
        let running = self
            .store
            .list_all_bots()?
            .iter()
            .filter(|b| b.state == BotState::Running)
            .count();
        self.metrics.running_bots.set(running as u64);
        Ok(self.metrics.export_prometheus())
    }

    // ---- internals -----------------------------------------------------

    fn tracked<T>(&self, operation: &str, bot_id: Option<BotId>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_error(e);
            let target = bot_id.map(|id| format!(" for bot {}", id)).unwrap_or_default();
            if e.is_fatal() {
                error!("{}{} aborted on a store fault: {:?}", operation, target, e);
            } else {
                warn!("{}{} failed: {}", operation, target, e);
            }
        }
        result
    }

    fn lock(&self, bot_id: BotId) -> Result<BotLockGuard> {
        Ok(self.locks.acquire(bot_id, self.config.lock_timeout())?)
    }

    fn check_not_banned(&self, actor: &Actor) -> Result<()> {
        if self.config.is_admin(actor.user_id) {
            return Ok(());
        }
        match self.store.get_user(actor.user_id)? {
            Some(user) if user.is_banned => Err(BotError::Unauthorized(format!(
                "user {} is banned",
                actor.user_id
            ))),
            _ => Ok(()),
        }
    }

    fn require_admin(&self, actor: &Actor) -> Result<()> {
        if self.config.is_admin(actor.user_id) {
            Ok(())
        } else {
            Err(BotError::Unauthorized(format!(
                "user {} is not an administrator",
                actor.user_id
            )))
        }
    }

    /// Owner-or-admin check, done once per entry point.
    fn load_authorized(&self, actor: &Actor, bot_id: BotId) -> Result<BotRecord> {
        self.check_not_banned(actor)?;
        let bot = self
            .store
            .get_bot(bot_id)?
            .ok_or_else(|| BotError::NotFound(format!("bot {}", bot_id)))?;
        if bot.owner_id != actor.user_id && !self.config.is_admin(actor.user_id) {
            return Err(BotError::Unauthorized(format!(
                "bot {} belongs to another user",
                bot_id
            )));
        }
        Ok(bot)
    }

    fn reload(&self, bot_id: BotId) -> Result<BotRecord> {
        self.store
            .get_bot(bot_id)?
            .ok_or_else(|| BotError::NotFound(format!("bot {}", bot_id)))
    }

    fn context_for(&self, bot: &BotRecord) -> Result<Option<Arc<dyn ExecutionContext>>> {
        if let Some(handle) = self.handles.get(bot.bot_id) {
            return Ok(Some(handle));
        }
        let Some(reference) = &bot.handle_ref else {
            return Ok(None);
        };
        let found = self.runtime.get_by_reference(reference)?;
        if let Some(handle) = &found {
            self.handles.insert(bot.bot_id, Arc::clone(handle));
        }
        Ok(found)
    }

    /// Correct a `running` record whose context is gone. Caller holds the lock.
    ///
    /// When the runtime cannot be asked, the record is returned unchanged.
    fn reconcile(&self, bot: BotRecord) -> Result<BotRecord> {
        if bot.state != BotState::Running {
            return Ok(bot);
        }
        let context = match self.context_for(&bot) {
            Ok(context) => context,
            Err(e) => {
                warn!("Cannot reconcile bot {}: {}", bot.bot_id, e);
                return Ok(bot);
            }
        };
        if let Some(handle) = &context {
            match handle.is_present() {
                Ok(true) => return Ok(bot),
                Ok(false) => {}
                Err(e) => {
                    warn!("Cannot reconcile bot {}: {}", bot.bot_id, e);
                    return Ok(bot);
                }
            }
            if let Err(e) = handle.remove() {
                warn!("Leftovers of bot {} not released: {}", bot.bot_id, e);
            }
        }
        self.handles.remove(bot.bot_id);
        self.store.update_status(bot.bot_id, BotState::Stopped, None)?;
        self.store.append_log(
            bot.bot_id,
            Severity::Warning,
            "Execution context no longer exists; marked stopped",
        )?;
        self.metrics.crash_reconciliations.inc();
        self.metrics.running_bots.dec();
        info!("Bot {} was recorded running without a context; now stopped", bot.bot_id);
        self.reload(bot.bot_id)
    }

    /// Listings never wait on a busy bot; its record is shown as stored.
    fn reconcile_listing(&self, bots: Vec<BotRecord>) -> Vec<BotRecord> {
        bots.into_iter()
            .map(|bot| {
                if bot.state != BotState::Running {
                    return bot;
                }
                let Ok(_guard) = self.locks.acquire(bot.bot_id, Duration::ZERO) else {
                    return bot;
                };
                let fallback = bot.clone();
                self.reconcile(bot).unwrap_or(fallback)
            })
            .collect()
    }

    fn stage_and_check(&self, filename: &str, bytes: &[u8]) -> Result<(StagedUpload, ValidationResult)> {
        let staged = self.workspaces.stage(filename, bytes)?;
        let validation = self.validator.validate(&staged.source, staged.language);
        if !validation.valid {
            self.metrics.validation_failures.inc();
        }
        Ok((staged, validation))
    }

    /// Store the committed artifact and move the record to the state its
    /// validation earned.
    fn record_artifact(
        &self,
        bot_id: BotId,
        workspace: &Path,
        staged_entry: &str,
        language: Language,
        validation: &ValidationResult,
        verb: &str,
    ) -> Result<BotState> {
        self.store.set_artifact(bot_id, workspace, staged_entry, language)?;
        let state = if validation.valid {
            BotState::Stopped
        } else {
            BotState::Uploaded
        };
        self.store.update_status(bot_id, state, None)?;
        if validation.valid {
            self.store.append_log(
                bot_id,
                Severity::Info,
                &format!("{} {} ({}), syntax OK", verb, staged_entry, language),
            )?;
        } else {
            let first = validation
                .errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_default();
            self.store.append_log(
                bot_id,
                Severity::Warning,
                &format!("{} {} ({}), syntax check failed: {}", verb, staged_entry, language, first),
            )?;
        }
        Ok(state)
    }

    fn do_upload(&self, actor: &Actor, filename: &str, bytes: &[u8]) -> Result<UploadReport> {
        self.check_not_banned(actor)?;
        self.store.upsert_user(actor.user_id, actor.username.as_deref())?;

        let (staged, validation) = self.stage_and_check(filename, bytes)?;
        let language = staged.language;
        let entry = staged.entry.clone();
        let dependencies = extract_dependencies(&staged.source, language);
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(filename)
            .to_string();

        let bot_id = self.store.create_bot(actor.user_id, &name, language)?;
        let committed = self.lock(bot_id).and_then(|guard| {
            let path = self.workspaces.commit(actor.user_id, bot_id, staged)?;
            Ok((guard, path))
        });
        let (_guard, workspace) = match committed {
            Ok(committed) => committed,
            Err(e) => {
                // No record without a workspace.
                if let Err(cleanup) = self.store.delete_bot(bot_id) {
                    error!("Bot {} left without workspace: {:?}", bot_id, cleanup);
                }
                return Err(e);
            }
        };
        let state = self.record_artifact(bot_id, &workspace, &entry, language, &validation, "Uploaded")?;
        self.metrics.uploads.inc();
        info!(
            "User {} uploaded bot {} ({}, {}), state {}",
            actor.user_id, bot_id, entry, language, state
        );

        Ok(UploadReport {
            bot_id,
            state,
            language,
            entry,
            workspace,
            validation,
            dependencies,
        })
    }

    fn do_reupload(&self, actor: &Actor, bot_id: BotId, filename: &str, bytes: &[u8]) -> Result<UploadReport> {
        let _guard = self.lock(bot_id)?;
        let bot = self.load_authorized(actor, bot_id)?;
        let bot = self.reconcile(bot)?;
        if bot.state == BotState::Running {
            return Err(BotError::InvalidState(format!(
                "bot {} is running; stop it before re-uploading",
                bot_id
            )));
        }

        let (staged, validation) = self.stage_and_check(filename, bytes)?;
        let language = staged.language;
        let entry = staged.entry.clone();
        let dependencies = extract_dependencies(&staged.source, language);
        let workspace = self.workspaces.commit(bot.owner_id, bot_id, staged)?;
        let state = self.record_artifact(bot_id, &workspace, &entry, language, &validation, "Re-uploaded")?;
        let installed = self.store.list_dependencies(bot_id)?;
        if !installed.is_empty() {
            let names: Vec<&str> = installed.iter().map(|d| d.name.as_str()).collect();
            self.store.append_log(
                bot_id,
                Severity::Info,
                &format!("Workspace replaced, reinstall needed for: {}", names.join(", ")),
            )?;
        }
        self.metrics.uploads.inc();
        info!("Bot {} re-uploaded ({}), state {}", bot_id, entry, state);

        Ok(UploadReport {
            bot_id,
            state,
            language,
            entry,
            workspace,
            validation,
            dependencies,
        })
    }

    fn launch_spec(&self, bot: &BotRecord, workspace: &Path, entry: &str) -> LaunchSpec {
        let adapter = bot.language.adapter();
        let toolchain = self.config.toolchain(bot.language);
        let uses_images = self.runtime.uses_images();
        // Inside an image the stock interpreter is the one that exists.
        let interpreter = if uses_images {
            adapter.default_interpreter().to_string()
        } else {
            toolchain.interpreter
        };
        LaunchSpec {
            instance: instance_name(bot.bot_id),
            image: uses_images.then_some(toolchain.image),
            command: adapter.run_command(&interpreter, entry),
            working_dir: workspace.to_path_buf(),
            log_path: self.workspaces.log_path(workspace),
            limits: ResourceLimits::from_config(&self.config),
            restart: RestartPolicy::UnlessStopped,
            stop_grace: self.config.stop_grace(),
        }
    }

    /// Launch a stopped bot. Caller holds the lock.
    fn launch_locked(&self, bot: &BotRecord) -> Result<BotRecord> {
        let (Some(workspace), Some(entry)) = (&bot.workspace, &bot.entry) else {
            return Err(BotError::InvalidState(format!(
                "bot {} has no stored artifact",
                bot.bot_id
            )));
        };
        let spec = self.launch_spec(bot, workspace, entry);
        let started = Instant::now();

        let context = match self.runtime.launch(&spec) {
            Ok(context) => context,
            Err(e) => {
                self.metrics.start_failures.inc();
                self.store.update_status(bot.bot_id, BotState::Stopped, None)?;
                self.store
                    .append_log(bot.bot_id, Severity::Error, &format!("Start failed: {}", e))?;
                return Err(e);
            }
        };

        if let Err(e) = self
            .store
            .update_status(bot.bot_id, BotState::Running, Some(context.reference()))
        {
            // Never leave a context the store does not know about.
            let _ = context.stop(Duration::ZERO);
            let _ = context.remove();
            return Err(e);
        }
        self.handles.insert(bot.bot_id, Arc::clone(&context));
        self.store.append_log(
            bot.bot_id,
            Severity::Info,
            &format!("Started on the {} runtime", self.runtime.name()),
        )?;
        self.metrics.starts.inc();
        self.metrics.running_bots.inc();
        self.metrics.launch_latency.observe(started.elapsed());
        info!(
            "Bot {} started as {} in {:?}",
            bot.bot_id,
            context.reference(),
            started.elapsed()
        );
        self.reload(bot.bot_id)
    }

    /// Stop a running bot and release its context. Caller holds the lock.
    /// A context that is already gone counts as stopped.
    fn stop_locked(&self, bot: &BotRecord, grace: Duration) -> Result<()> {
        if let Some(context) = self.context_for(bot)? {
            context.stop(grace)?;
            if let Err(e) = context.remove() {
                warn!("Context of bot {} stopped but not removed: {}", bot.bot_id, e);
                self.store.append_log(
                    bot.bot_id,
                    Severity::Warning,
                    &format!("Context not fully released: {}", e),
                )?;
            }
        }
        self.handles.remove(bot.bot_id);
        self.store.update_status(bot.bot_id, BotState::Stopped, None)?;
        self.store.append_log(bot.bot_id, Severity::Info, "Stopped")?;
        self.metrics.stops.inc();
        self.metrics.running_bots.dec();
        info!("Bot {} stopped", bot.bot_id);
        Ok(())
    }

    fn do_start(&self, actor: &Actor, bot_id: BotId) -> Result<BotRecord> {
        let _guard = self.lock(bot_id)?;
        let bot = self.load_authorized(actor, bot_id)?;
        let bot = self.reconcile(bot)?;
        match bot.state {
            BotState::Stopped => self.launch_locked(&bot),
            BotState::Running => Err(BotError::InvalidState(format!(
                "bot {} is already running",
                bot_id
            ))),
            BotState::Uploaded => Err(BotError::InvalidState(format!(
                "bot {} has not passed validation; upload a corrected version",
                bot_id
            ))),
            BotState::Deleted => Err(BotError::NotFound(format!("bot {}", bot_id))),
        }
    }

    fn do_stop(&self, actor: &Actor, bot_id: BotId) -> Result<BotRecord> {
        let _guard = self.lock(bot_id)?;
        let bot = self.load_authorized(actor, bot_id)?;
        if bot.state != BotState::Running {
            return Err(BotError::InvalidState(format!(
                "bot {} is not running (state {})",
                bot_id, bot.state
            )));
        }
        self.stop_locked(&bot, self.config.stop_grace())?;
        self.reload(bot_id)
    }

    fn do_restart(&self, actor: &Actor, bot_id: BotId) -> Result<BotRecord> {
        let _guard = self.lock(bot_id)?;
        let bot = self.load_authorized(actor, bot_id)?;
        if bot.state != BotState::Running {
            return Err(BotError::InvalidState(format!(
                "bot {} is not running (state {})",
                bot_id, bot.state
            )));
        }
        self.stop_locked(&bot, self.config.stop_grace())?;
        // Let ports and other host resources go before the next launch.
        std::thread::sleep(self.config.restart_delay());
        let bot = self.reload(bot_id)?;
        let record = self.launch_locked(&bot)?;
        self.metrics.restarts.inc();
        Ok(record)
    }

    fn do_delete(&self, actor: &Actor, bot_id: BotId) -> Result<()> {
        let guard = self.lock(bot_id)?;
        let bot = self.load_authorized(actor, bot_id)?;
        if bot.state == BotState::Running {
            self.stop_locked(&bot, Duration::ZERO)?;
        }
        if let Err(e) = self.workspaces.destroy(bot.owner_id, bot_id) {
            // The record stays so the workspace is never orphaned.
            self.store.append_log(
                bot_id,
                Severity::Error,
                &format!("Delete aborted, workspace not removed: {}", e),
            )?;
            return Err(e);
        }
        self.store.delete_bot(bot_id)?;
        self.locks.forget(&guard);
        self.metrics.deletes.inc();
        info!("Bot {} deleted by user {}", bot_id, actor.user_id);
        Ok(())
    }

    fn sink_of(&self, bot: &BotRecord) -> Option<PathBuf> {
        bot.workspace
            .as_deref()
            .map(|ws| self.workspaces.log_path(ws))
    }

    fn do_logs(&self, actor: &Actor, bot_id: BotId, tail_lines: Option<usize>) -> Result<String> {
        let _guard = self.lock(bot_id)?;
        let bot = self.load_authorized(actor, bot_id)?;
        let bot = self.reconcile(bot)?;
        let tail = tail_lines.unwrap_or(self.config.log_tail_lines);

        let live = if bot.state == BotState::Running {
            self.context_for(&bot)?
        } else {
            None
        };
        let text = match live {
            Some(context) => context.logs(tail)?,
            None => match self.sink_of(&bot) {
                Some(sink) => tail_file(&sink, tail, SINK_TAIL_BYTES)?,
                None => String::new(),
            },
        };
        Ok(truncate_for_display(&text, self.config.log_display_chars))
    }

    fn do_stats(&self, actor: &Actor, bot_id: BotId) -> Result<Option<UsageSample>> {
        let _guard = self.lock(bot_id)?;
        let bot = self.load_authorized(actor, bot_id)?;
        let bot = self.reconcile(bot)?;
        if bot.state != BotState::Running {
            return Ok(None);
        }
        let context = match self.context_for(&bot) {
            Ok(Some(context)) => context,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("No usage for bot {}: {}", bot_id, e);
                return Ok(None);
            }
        };
        let sample = self.monitor.sample(context.as_ref());
        if let Some(usage) = &sample {
            self.store
                .record_usage(bot_id, usage.cpu_percent, usage.memory_mb)?;
        }
        Ok(sample)
    }

    fn do_install(&self, actor: &Actor, bot_id: BotId, package: &str) -> Result<InstallReport> {
        let _guard = self.lock(bot_id)?;
        let bot = self.load_authorized(actor, bot_id)?;
        let workspace = bot.workspace.clone().ok_or_else(|| {
            BotError::InvalidState(format!("bot {} has no workspace", bot_id))
        })?;

        let started = Instant::now();
        match self.installer.install(&workspace, bot.language, package) {
            Ok(report) => {
                self.metrics.install_duration.observe(started.elapsed());
                self.metrics.installs.inc();
                self.store
                    .append_dependency(bot_id, &report.package, &report.version)?;
                self.store.append_log(bot_id, Severity::Info, &report.message)?;
                Ok(report)
            }
            Err(e) => {
                self.metrics.install_duration.observe(started.elapsed());
                self.metrics.install_failures.inc();
                self.store.append_log(
                    bot_id,
                    Severity::Error,
                    &format!("Install of {} failed: {}", package, e.user_message()),
                )?;
                Err(e)
            }
        }
    }
}
