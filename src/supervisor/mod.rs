//! Worker process supervisor.
//!
//! Enforces at-most-one-live-worker-per-session: launching for a session
//! id that already holds a live lock first terminates the old process —
//! graceful signal, bounded grace wait, forced kill — and only then
//! spawns the replacement ("supersede"). This is the system's only
//! cancellation primitive; there is no in-flight stage cancellation.
//!
//! On unix the graceful signal is SIGTERM delivered to the worker's
//! process group leader. Windows has no equivalent for a detached
//! process, so the grace window there only waits for a voluntary exit
//! before the handle is killed.

pub mod launch;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::invocation::{InvocationUri, Operation, PARAM_SERVER_URL};
use crate::{AppError, Result};

pub use launch::{platform_strategy, LaunchStrategy};

/// Lock record proving which process owns a session.
///
/// Invariant: at most one non-terminated lock per session id at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerLock {
    /// Session the worker belongs to.
    pub session_id: String,
    /// OS process id of the live worker.
    pub process_id: u32,
    /// On-disk lock file recording this claim.
    pub lock_path: PathBuf,
    /// When the worker was spawned.
    pub spawned_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LiveWorker {
    lock: WorkerLock,
    child: Child,
}

/// Per-session worker supervisor (see module docs).
#[derive(Debug)]
pub struct Supervisor {
    config: Arc<GlobalConfig>,
    strategy: Box<dyn LaunchStrategy>,
    locks: Mutex<HashMap<String, LiveWorker>>,
    /// Serializes launch/terminate per session id. The global `locks` map
    /// is only held for lookup/insert/remove; the grace-kill escalation
    /// runs under the per-session guard alone, so launches for other
    /// sessions proceed in parallel.
    session_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Supervisor {
    /// Build a supervisor with the platform launch strategy.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self::with_strategy(config, platform_strategy())
    }

    /// Build a supervisor with an explicit launch strategy (tests inject
    /// their own here).
    #[must_use]
    pub fn with_strategy(config: Arc<GlobalConfig>, strategy: Box<dyn LaunchStrategy>) -> Self {
        Self {
            config,
            strategy,
            locks: Mutex::new(HashMap::new()),
            session_guards: Mutex::new(HashMap::new()),
        }
    }

    /// Per-session serialization guard; created on first use and kept for
    /// the supervisor's lifetime.
    async fn session_guard(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.session_guards.lock().await;
        Arc::clone(guards.entry(session_id.to_owned()).or_default())
    }

    /// Launch (or supersede) the worker for a session.
    ///
    /// The invocation URI handed to the worker always carries a
    /// `serverUrl` parameter so the process can open its own progress
    /// channel; callers may override it through `params`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if spawning fails; the failure is
    /// surfaced synchronously and never silently retried.
    pub async fn launch(
        &self,
        session_id: &str,
        operation: Operation,
        params: BTreeMap<String, String>,
    ) -> Result<WorkerLock> {
        let span = info_span!("launch_worker", session_id, operation = %operation);
        self.launch_inner(session_id, operation, params)
            .instrument(span)
            .await
    }

    async fn launch_inner(
        &self,
        session_id: &str,
        operation: Operation,
        params: BTreeMap<String, String>,
    ) -> Result<WorkerLock> {
        let mut uri = InvocationUri::new(operation, session_id);
        uri.params = params;
        uri.params
            .entry(PARAM_SERVER_URL.to_owned())
            .or_insert_with(|| format!("ws://127.0.0.1:{}", self.config.http_port));
        let uri_text = uri.to_uri();

        let guard = self.session_guard(session_id).await;
        let _serial = guard.lock().await;

        // Take the old worker out under a short map lock; the escalation
        // below runs with only the per-session guard held.
        let previous = self.locks.lock().await.remove(session_id);
        if let Some(previous) = previous {
            info!(
                session_id,
                old_pid = previous.lock.process_id,
                "superseding live worker"
            );
            self.terminate_worker(previous).await;
        }

        std::fs::create_dir_all(&self.config.lock_dir)
            .map_err(|err| AppError::Launch(format!("cannot create lock dir: {err}")))?;

        let child = self.strategy.launch(&self.config.worker_bin, &uri_text)?;
        let process_id = child
            .id()
            .ok_or_else(|| AppError::Launch("worker exited before it could be tracked".into()))?;

        let lock_path = self.config.lock_dir.join(format!("{session_id}.lock"));
        let lock = WorkerLock {
            session_id: session_id.to_owned(),
            process_id,
            lock_path: lock_path.clone(),
            spawned_at: Utc::now(),
        };
        write_lock_file(&lock)?;

        self.locks
            .lock()
            .await
            .insert(session_id.to_owned(), LiveWorker { lock: lock.clone(), child });
        info!(session_id, pid = process_id, "worker lock recorded");
        Ok(lock)
    }

    /// Terminate the live worker for a session, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when no live lock exists for the id.
    pub async fn terminate(&self, session_id: &str) -> Result<()> {
        let guard = self.session_guard(session_id).await;
        let _serial = guard.lock().await;

        let worker = self
            .locks
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("no live worker for {session_id}")))?;
        self.terminate_worker(worker).await;
        Ok(())
    }

    /// Current lock record for a session, if a worker is live.
    pub async fn active_lock(&self, session_id: &str) -> Option<WorkerLock> {
        let locks = self.locks.lock().await;
        locks.get(session_id).map(|worker| worker.lock.clone())
    }

    /// Number of live workers.
    pub async fn live_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Graceful-then-forced termination of one worker.
    async fn terminate_worker(&self, mut worker: LiveWorker) {
        let session_id = worker.lock.session_id.clone();
        let grace = self.config.timeouts.grace_kill();

        send_graceful_signal(&worker);

        match tokio::time::timeout(grace, worker.child.wait()).await {
            Ok(Ok(exit)) => {
                info!(session_id, ?exit, "worker exited within grace period");
            }
            Ok(Err(err)) => {
                warn!(session_id, %err, "error waiting for worker exit");
            }
            Err(_) => {
                warn!(
                    session_id,
                    grace_secs = grace.as_secs(),
                    "worker ignored graceful signal; forcing kill"
                );
                if let Err(err) = worker.child.kill().await {
                    warn!(session_id, %err, "failed to force-kill worker");
                }
            }
        }

        if let Err(err) = std::fs::remove_file(&worker.lock.lock_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id, %err, "failed to remove lock file");
            }
        }
    }
}

/// Deliver the platform's graceful termination signal, when one exists.
#[cfg(unix)]
fn send_graceful_signal(worker: &LiveWorker) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw_pid) = i32::try_from(worker.lock.process_id) else {
        warn!(
            session_id = %worker.lock.session_id,
            pid = worker.lock.process_id,
            "pid out of signed range; will rely on forced kill"
        );
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
        warn!(
            session_id = %worker.lock.session_id,
            %err,
            "SIGTERM delivery failed; will rely on forced kill"
        );
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_worker: &LiveWorker) {
    // No detached-process SIGTERM equivalent on this platform; the grace
    // window only waits for a voluntary exit.
}

fn write_lock_file(lock: &WorkerLock) -> Result<()> {
    let json = serde_json::to_string_pretty(lock)
        .map_err(|err| AppError::Launch(format!("cannot encode lock record: {err}")))?;
    std::fs::write(&lock.lock_path, json)
        .map_err(|err| AppError::Launch(format!("cannot write lock file: {err}")))
}
