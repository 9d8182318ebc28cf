//! End-to-end lifecycle tests
//!
//! Most tests drive the supervisor over the JSON store with the scripted
//! runtime. The native tests re-execute the built binary as keeper and need
//! python3 on the host; they skip themselves otherwise.

use botbox::kernel::procfs;
use botbox::runtime::{IsolationRuntime, NativeRuntime};
use botbox::store::{JsonFileStore, MetadataStore};
use botbox::testing::{test_config, ScriptedRuntime};
use botbox::{Actor, BotError, BotState, BotSupervisor, Severity};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zip::write::SimpleFileOptions;

fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn owner() -> Actor {
    Actor::new(7).with_username("carol")
}

#[test]
fn test_full_lifecycle_over_json_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    let runtime = Arc::new(ScriptedRuntime::new());
    let supervisor = BotSupervisor::new(config, store.clone(), runtime.clone()).unwrap();

    let report = supervisor
        .upload(&owner(), "echo.py", b"import telebot\nprint('up')\n")
        .unwrap();
    assert_eq!(report.state, BotState::Stopped);
    assert!(report.dependencies.contains("telebot"));
    let id = report.bot_id;

    let running = supervisor.start(&owner(), id).unwrap();
    assert_eq!(running.state, BotState::Running);
    assert!(running.last_active.is_some());

    let spec = runtime.last_spec().unwrap();
    assert_eq!(spec.instance, format!("bot-{}", id));
    assert_eq!(spec.working_dir, report.workspace);
    assert!(spec.command.iter().any(|arg| arg == "echo.py"));
    assert!(spec.image.is_none());

    let stopped = supervisor.stop(&owner(), id).unwrap();
    assert_eq!(stopped.state, BotState::Stopped);
    assert!(stopped.handle_ref.is_none());

    let severities: Vec<Severity> = supervisor
        .history(&owner(), id, None)
        .unwrap()
        .into_iter()
        .map(|e| e.severity)
        .collect();
    assert!(severities.iter().all(|s| *s == Severity::Info));

    supervisor.delete(&owner(), id).unwrap();
    assert!(matches!(
        supervisor.status(&owner(), id),
        Err(BotError::NotFound(_))
    ));
    assert!(!report.workspace.exists());
    assert!(store.list_all_bots().unwrap().is_empty());
}

#[test]
fn test_ids_are_never_reused_after_delete() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    let supervisor = BotSupervisor::new(config, store, Arc::new(ScriptedRuntime::new())).unwrap();

    let first = supervisor.upload(&owner(), "a.py", b"print(1)\n").unwrap().bot_id;
    supervisor.delete(&owner(), first).unwrap();
    let second = supervisor.upload(&owner(), "b.py", b"print(2)\n").unwrap().bot_id;
    assert!(second > first);
}

#[test]
fn test_zip_upload_unwraps_folder_and_finds_entry() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    let supervisor = BotSupervisor::new(config, store, Arc::new(ScriptedRuntime::new())).unwrap();

    let archive = zip_of(&[
        ("project/main.py", "from helpers import greet\nimport aiogram\ngreet()\n"),
        ("project/helpers.py", "def greet():\n    print('hi')\n"),
        ("project/requirements.txt", "aiogram\n"),
    ]);
    let report = supervisor.upload(&owner(), "project.zip", &archive).unwrap();
    assert_eq!(report.entry, "main.py");
    assert!(report.workspace.join("helpers.py").is_file());
    assert!(report.dependencies.contains("aiogram"));
}

#[test]
fn test_unsupported_upload_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    let supervisor = BotSupervisor::new(config, store.clone(), Arc::new(ScriptedRuntime::new())).unwrap();

    assert!(matches!(
        supervisor.upload(&owner(), "bot.rb", b"puts 1\n"),
        Err(BotError::UnsupportedUpload(_))
    ));
    assert!(store.list_all_bots().unwrap().is_empty());
}

#[test]
fn test_restarted_supervisor_reconciles_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    let runtime = Arc::new(ScriptedRuntime::new());

    let id = {
        let supervisor = BotSupervisor::new(config.clone(), store.clone(), runtime.clone()).unwrap();
        let id = supervisor.upload(&owner(), "bot.py", b"print(1)\n").unwrap().bot_id;
        supervisor.start(&owner(), id).unwrap();
        id
    };

    // A fresh supervisor has no handles; the stored reference still resolves.
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    let supervisor = BotSupervisor::new(config, store, runtime.clone()).unwrap();
    assert_eq!(supervisor.status(&owner(), id).unwrap().state, BotState::Running);

    runtime.crash_all();
    let listed = supervisor.list_bots(&owner()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, BotState::Stopped);
    assert_eq!(runtime.live_contexts(), 0);
}

#[test]
fn test_concurrent_starts_launch_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    let runtime = Arc::new(ScriptedRuntime::new());
    let supervisor = Arc::new(BotSupervisor::new(config, store, runtime.clone()).unwrap());
    let id = supervisor.upload(&owner(), "bot.py", b"print(1)\n").unwrap().bot_id;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || supervisor.start(&owner(), id))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let started = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(started, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, BotError::InvalidState(_))));
    assert_eq!(runtime.launches(), 1);
}

#[test]
fn test_metrics_exposition_counts_operations() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    let supervisor = BotSupervisor::new(config, store, Arc::new(ScriptedRuntime::new())).unwrap();
    let id = supervisor.upload(&owner(), "bot.py", b"print(1)\n").unwrap().bot_id;
    supervisor.start(&owner(), id).unwrap();
    let _ = supervisor.start(&owner(), id);

    let text = supervisor.export_metrics().unwrap();
    assert!(text.contains("botbox_starts_total 1"));
    assert!(text.contains("botbox_running_bots 1"));
    assert!(text.contains("kind=\"invalid_state\"} 1"));
}

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn native_supervisor(dir: &std::path::Path) -> (BotSupervisor, PathBuf) {
    let mut config = test_config(dir);
    config.python.interpreter = Some("python3".to_string());
    config.stop_grace_ms = 500;
    let root = config.root_dir.clone();

    let runtime = Arc::new(
        NativeRuntime::new(
            &config.root_dir,
            PathBuf::from(env!("CARGO_BIN_EXE_botbox")),
            None,
        )
        .unwrap(),
    );
    assert_eq!(runtime.name(), "native");
    let store = Arc::new(JsonFileStore::open(&config.store_path).unwrap());
    (BotSupervisor::new(config, store, runtime).unwrap(), root)
}

const LOOPING_BOT: &[u8] =
    b"import time\nprint('hello from bot', flush=True)\nwhile True:\n    time.sleep(0.2)\n";

fn wait_for_output(supervisor: &BotSupervisor, id: u64, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = String::new();
    while Instant::now() < deadline {
        seen = supervisor.logs(&owner(), id, None).unwrap();
        if seen.contains(needle) {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    seen
}

#[test]
fn test_native_runtime_runs_keeper_and_stops_it() {
    if !python3_available() {
        eprintln!("Skipping: python3 not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _) = native_supervisor(dir.path());

    let id = supervisor.upload(&owner(), "bot.py", LOOPING_BOT).unwrap().bot_id;
    let running = supervisor.start(&owner(), id).unwrap();
    assert!(running.handle_ref.unwrap().starts_with("native:"));

    let seen = wait_for_output(&supervisor, id, "hello from bot");
    assert!(seen.contains("hello from bot"), "logs were: {}", seen);

    // Without cgroups there is nothing to sample.
    assert!(supervisor.stats(&owner(), id).unwrap().is_none());

    let stopped = supervisor.stop(&owner(), id).unwrap();
    assert_eq!(stopped.state, BotState::Stopped);
    assert_eq!(supervisor.status(&owner(), id).unwrap().state, BotState::Stopped);
    // Output survives in the sink after the stop.
    assert!(supervisor.logs(&owner(), id, None).unwrap().contains("hello from bot"));
}

#[test]
fn test_native_payload_survives_keeper_kill_until_stopped() {
    if !python3_available() {
        eprintln!("Skipping: python3 not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, root) = native_supervisor(dir.path());

    let id = supervisor.upload(&owner(), "bot.py", LOOPING_BOT).unwrap().bot_id;
    supervisor.start(&owner(), id).unwrap();
    let seen = wait_for_output(&supervisor, id, "hello from bot");
    assert!(seen.contains("hello from bot"), "logs were: {}", seen);

    let record: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(root.join(".runtime").join(format!("bot-{}.json", id))).unwrap(),
    )
    .unwrap();
    let keeper_pid = record["pid"].as_u64().unwrap() as u32;
    kill(Pid::from_raw(keeper_pid as i32), Signal::SIGKILL).unwrap();
    thread::sleep(Duration::from_millis(200));

    // The keeper is gone but the bot's program is not.
    assert!(!procfs::group_members(keeper_pid).is_empty());
    assert_eq!(supervisor.status(&owner(), id).unwrap().state, BotState::Running);

    let stopped = supervisor.stop(&owner(), id).unwrap();
    assert_eq!(stopped.state, BotState::Stopped);
    assert!(procfs::group_members(keeper_pid).is_empty());
    supervisor.delete(&owner(), id).unwrap();
}
