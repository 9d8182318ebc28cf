/// In-process isolation runtime driven entirely by the test
///
/// Contexts never run anything. Tests decide when a context disappears, when
/// a launch fails and when the runtime stops answering.
use crate::config::types::{BotError, Result};
use crate::runtime::{ExecutionContext, IsolationRuntime, LaunchSpec, StatsSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCRIPTED_MEMORY_BYTES: u64 = 64 * 1024 * 1024;
const SCRIPTED_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;

#[derive(Debug)]
pub struct ScriptedContext {
    reference: String,
    instance: String,
    present: AtomicBool,
    removed: AtomicBool,
    stops: AtomicUsize,
    snapshots: AtomicU64,
    unavailable: Arc<AtomicBool>,
    fail_remove: Arc<AtomicBool>,
}

impl ScriptedContext {
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn reachable(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BotError::InfrastructureUnavailable(
                "scripted runtime is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl ExecutionContext for ScriptedContext {
    fn reference(&self) -> String {
        self.reference.clone()
    }

    fn is_present(&self) -> Result<bool> {
        self.reachable()?;
        Ok(self.present.load(Ordering::SeqCst))
    }

    fn stop(&self, _grace: Duration) -> Result<()> {
        self.reachable()?;
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.present.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        self.reachable()?;
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(BotError::InfrastructureUnavailable(format!(
                "{} could not be removed",
                self.instance
            )));
        }
        self.present.store(false, Ordering::SeqCst);
        self.removed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn logs(&self, tail_lines: usize) -> Result<String> {
        self.reachable()?;
        Ok(crate::utils::output::tail_lines(
            &format!("scripted output from {}\n", self.instance),
            tail_lines,
        ))
    }

    /// Every call advances the counters by 50 ms of context CPU over 200 ms
    /// of host CPU, so any two consecutive snapshots read as 25%.
    fn stats_snapshot(&self) -> Result<StatsSnapshot> {
        self.reachable()?;
        let n = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StatsSnapshot {
            cpu_usage_usec: n * 50_000,
            system_usage_usec: n * 200_000,
            memory_bytes: SCRIPTED_MEMORY_BYTES,
            memory_limit_bytes: Some(SCRIPTED_MEMORY_LIMIT),
            oom_kills: Some(0),
            process_count: Some(1),
        })
    }
}

#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    launches: AtomicUsize,
    unavailable: Arc<AtomicBool>,
    fail_remove: Arc<AtomicBool>,
    fail_next: Mutex<Option<String>>,
    contexts: Mutex<HashMap<String, Arc<ScriptedContext>>>,
    last_spec: Mutex<Option<LaunchSpec>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// The next launch fails with `LaunchFailed(message)`.
    pub fn fail_next_launch(&self, message: &str) {
        *lock(&self.fail_next) = Some(message.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `remove` fail on every context until cleared.
    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    /// Make the context of `instance` vanish, as if its process had died.
    pub fn crash(&self, instance: &str) {
        for context in lock(&self.contexts).values() {
            if context.instance == instance {
                context.present.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn crash_all(&self) {
        for context in lock(&self.contexts).values() {
            context.present.store(false, Ordering::SeqCst);
        }
    }

    /// Contexts launched and not yet removed.
    pub fn live_contexts(&self) -> usize {
        lock(&self.contexts)
            .values()
            .filter(|c| !c.is_removed())
            .count()
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        lock(&self.last_spec).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl IsolationRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    fn uses_images(&self) -> bool {
        false
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ExecutionContext>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BotError::InfrastructureUnavailable(
                "scripted runtime is offline".to_string(),
            ));
        }
        *lock(&self.last_spec) = Some(spec.clone());
        if let Some(message) = lock(&self.fail_next).take() {
            return Err(BotError::LaunchFailed(message));
        }

        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let context = Arc::new(ScriptedContext {
            reference: format!("scripted:{}#{}", spec.instance, n),
            instance: spec.instance.clone(),
            present: AtomicBool::new(true),
            removed: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
            snapshots: AtomicU64::new(0),
            unavailable: Arc::clone(&self.unavailable),
            fail_remove: Arc::clone(&self.fail_remove),
        });
        lock(&self.contexts).insert(context.reference.clone(), Arc::clone(&context));
        Ok(context)
    }

    fn get_by_reference(&self, reference: &str) -> Result<Option<Arc<dyn ExecutionContext>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BotError::InfrastructureUnavailable(
                "scripted runtime is offline".to_string(),
            ));
        }
        Ok(lock(&self.contexts)
            .get(reference)
            .filter(|c| !c.is_removed())
            .map(|c| Arc::clone(c) as Arc<dyn ExecutionContext>))
    }
}
