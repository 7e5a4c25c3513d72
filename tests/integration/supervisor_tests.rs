//! Process supervisor: lock files, supersede-before-spawn, termination.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::process::{Child, Command};

use paperflow::errors::AppError;
use paperflow::invocation::Operation;
use paperflow::supervisor::{platform_strategy, LaunchStrategy, Supervisor};

use super::test_helpers::test_config;

/// Test stand-in that launches a long sleep instead of a real worker.
#[derive(Debug)]
struct SleepLaunch;

impl LaunchStrategy for SleepLaunch {
    fn launch(&self, _worker_bin: &str, _uri: &str) -> paperflow::Result<Child> {
        Command::new("sleep")
            .arg("30")
            .kill_on_drop(false)
            .spawn()
            .map_err(|err| AppError::Launch(format!("failed to spawn worker: {err}")))
    }

    fn name(&self) -> &'static str {
        "sleep-test"
    }
}

/// Test stand-in whose process ignores SIGTERM, forcing the full grace
/// window before the forced kill lands.
#[derive(Debug)]
struct StubbornLaunch;

impl LaunchStrategy for StubbornLaunch {
    fn launch(&self, _worker_bin: &str, _uri: &str) -> paperflow::Result<Child> {
        Command::new("sh")
            .arg("-c")
            .arg("trap : TERM; while :; do sleep 1; done")
            .kill_on_drop(false)
            .spawn()
            .map_err(|err| AppError::Launch(format!("failed to spawn worker: {err}")))
    }

    fn name(&self) -> &'static str {
        "stubborn-test"
    }
}

fn sleep_supervisor(dir: &std::path::Path) -> Supervisor {
    Supervisor::with_strategy(Arc::new(test_config(dir)), Box::new(SleepLaunch))
}

#[tokio::test]
async fn launch_writes_a_lock_file_with_the_live_pid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = sleep_supervisor(dir.path());

    let lock = supervisor
        .launch("sup-1", Operation::FullGenerate, BTreeMap::new())
        .await
        .expect("launch");

    assert_eq!(lock.session_id, "sup-1");
    assert!(lock.process_id > 0);
    assert!(lock.lock_path.exists());

    let raw = std::fs::read_to_string(&lock.lock_path).expect("read lock file");
    let persisted: paperflow::supervisor::WorkerLock =
        serde_json::from_str(&raw).expect("decode lock file");
    assert_eq!(persisted.process_id, lock.process_id);
    assert_eq!(supervisor.live_count().await, 1);

    supervisor.terminate("sup-1").await.expect("terminate");
    assert!(!lock.lock_path.exists());
    assert_eq!(supervisor.live_count().await, 0);
}

#[tokio::test]
async fn relaunch_supersedes_the_previous_worker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = sleep_supervisor(dir.path());

    let first = supervisor
        .launch("sup-2", Operation::FullGenerate, BTreeMap::new())
        .await
        .expect("first launch");
    let second = supervisor
        .launch("sup-2", Operation::FullGenerate, BTreeMap::new())
        .await
        .expect("second launch");

    assert_ne!(first.process_id, second.process_id);
    assert_eq!(supervisor.live_count().await, 1);

    let active = supervisor.active_lock("sup-2").await.expect("active lock");
    assert_eq!(active.process_id, second.process_id);

    supervisor.terminate("sup-2").await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread")]
async fn supersede_grace_window_does_not_block_other_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.timeouts.grace_kill_seconds = 1;
    let supervisor = Arc::new(Supervisor::with_strategy(
        Arc::new(config),
        Box::new(StubbornLaunch),
    ));

    supervisor
        .launch("sup-slow", Operation::FullGenerate, BTreeMap::new())
        .await
        .expect("first launch");

    // Relaunching the same session rides out the full grace window
    // because the worker ignores SIGTERM.
    let supersede = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            supervisor
                .launch("sup-slow", Operation::FullGenerate, BTreeMap::new())
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // An unrelated session's launch must not queue behind that wait.
    let started = std::time::Instant::now();
    supervisor
        .launch("sup-fast", Operation::FullGenerate, BTreeMap::new())
        .await
        .expect("independent launch");
    let waited = started.elapsed();
    assert!(
        waited < std::time::Duration::from_millis(500),
        "independent launch waited {waited:?}"
    );

    supersede
        .await
        .expect("supersede task")
        .expect("supersede launch");
    supervisor.terminate("sup-slow").await.expect("terminate slow");
    supervisor.terminate("sup-fast").await.expect("terminate fast");
    assert_eq!(supervisor.live_count().await, 0);
}

#[tokio::test]
async fn terminate_without_a_live_worker_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = sleep_supervisor(dir.path());

    match supervisor.terminate("sup-absent").await {
        Err(AppError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_worker_binary_surfaces_a_launch_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.worker_bin = "paperflow-worker-definitely-absent".into();
    let supervisor = Supervisor::with_strategy(Arc::new(config), platform_strategy());

    match supervisor
        .launch("sup-3", Operation::SingleGenerate, BTreeMap::new())
        .await
    {
        Err(AppError::Launch(message)) => {
            assert!(message.contains("not found"), "message: {message}");
        }
        other => panic!("expected Launch error, got {other:?}"),
    }
    assert_eq!(supervisor.live_count().await, 0);
}
