//! Server-side session registry.
//!
//! Single owner of session lifecycle: an in-memory map from session id to
//! session state, metadata, and the attached progress channel (if any).
//! Exposes exactly four mutating operations — `create`, `attach_channel`,
//! `publish`, `finalize` — plus read-only snapshots and the eviction sweep.
//!
//! Locking model: the outer map is guarded by a `std::sync::RwLock` held
//! only for lookup/insert/remove; each session entry sits behind its own
//! `tokio::sync::Mutex`, so operations on different sessions proceed fully
//! in parallel. Entry locks are never held across socket I/O — forwarding
//! into a channel uses the non-blocking `try_send`.

pub mod eviction;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::progress::{ProgressMessage, ProgressStatus};
use crate::models::session::{Session, SessionError, SessionState};
use crate::{AppError, Result};

/// Buffered capacity of the per-channel forwarding queue.
const CHANNEL_CAPACITY: usize = 64;

/// Handle to the channel currently attached to a session.
///
/// Dropping the receiver side or cancelling `closer` ends delivery; the
/// registry detects a dead sender on the next publish and falls back to
/// buffering.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    seq: u64,
    tx: mpsc::Sender<ProgressMessage>,
    closer: CancellationToken,
}

/// What a freshly attached channel receives from the registry.
#[derive(Debug)]
pub struct ChannelAttachment {
    /// Ordered stream of messages published for the session.
    pub rx: mpsc::Receiver<ProgressMessage>,
    /// Cancelled when this channel is superseded by a newer attach.
    pub superseded: CancellationToken,
    /// Identity used to detach exactly this channel later.
    pub seq: u64,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    channel: Option<ChannelHandle>,
    /// Latest non-keepalive message, replayed to late-joining channels.
    buffered: Option<ProgressMessage>,
    ever_attached: bool,
    terminal_at: Option<DateTime<Utc>>,
}

type EntryRef = Arc<Mutex<SessionEntry>>;

/// In-memory session registry (see module docs).
#[derive(Debug)]
pub struct SessionRegistry {
    retention: Duration,
    staging: Duration,
    channel_seq: AtomicU64,
    sessions: RwLock<HashMap<String, EntryRef>>,
    /// Serializes whole `create` calls so the active-session check and the
    /// insert are one atomic step against a racing create for the same id.
    create_guard: Mutex<()>,
}

impl SessionRegistry {
    /// Build a registry with the given retention and staging windows.
    #[must_use]
    pub fn new(retention: Duration, staging: Duration) -> Self {
        Self {
            retention,
            staging,
            channel_seq: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            create_guard: Mutex::new(()),
        }
    }

    /// Create a session in `CREATED` state.
    ///
    /// An expired or terminal session under the same id is replaced; the
    /// id is only considered taken while its session is active.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DuplicateSession` if an active session with the
    /// same id exists, or `AppError::Validation` for an empty id.
    pub async fn create(
        &self,
        session_id: &str,
        metadata: HashMap<String, String>,
        repo_path: Option<String>,
    ) -> Result<Session> {
        if session_id.trim().is_empty() {
            return Err(AppError::Validation("session_id must not be empty".into()));
        }

        // Hold the guard across the check and the insert: two racing
        // creates for the same id must resolve to one Ok and one
        // DuplicateSession, never a silent replacement.
        let _create = self.create_guard.lock().await;

        if let Some(entry_ref) = self.entry(session_id) {
            let entry = entry_ref.lock().await;
            if !self.is_expired(&entry, Utc::now()) && !entry.session.state.is_terminal() {
                return Err(AppError::DuplicateSession(format!(
                    "session {session_id} is still active"
                )));
            }
        }

        let session = Session::new(session_id.to_owned(), metadata, repo_path);
        let entry = Arc::new(Mutex::new(SessionEntry {
            session: session.clone(),
            channel: None,
            buffered: None,
            ever_attached: false,
            terminal_at: None,
        }));

        {
            let mut map = self
                .sessions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.insert(session_id.to_owned(), entry);
        }

        info!(session_id, "session created");
        Ok(session)
    }

    /// Create the session only if it does not already exist.
    ///
    /// Used by the request-id channel variant, where the first attach
    /// implicitly stages an ephemeral session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty id.
    pub async fn ensure(&self, session_id: &str) -> Result<Session> {
        match self.create(session_id, HashMap::new(), None).await {
            Ok(session) => Ok(session),
            Err(AppError::DuplicateSession(_)) => self
                .snapshot(session_id)
                .await
                .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found"))),
            Err(err) => Err(err),
        }
    }

    /// Bind a connection to the session's progress channel.
    ///
    /// If a previous channel is still open it is superseded: its token is
    /// cancelled first, then the new channel takes its place. The latest
    /// buffered message (current state, not history) is replayed into the
    /// new channel so late joiners render something immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session id.
    pub async fn attach_channel(&self, session_id: &str) -> Result<ChannelAttachment> {
        let entry_ref = self
            .entry(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let closer = CancellationToken::new();
        let seq = self.channel_seq.fetch_add(1, Ordering::Relaxed);

        let mut entry = entry_ref.lock().await;
        if let Some(old) = entry.channel.take() {
            info!(session_id, old_seq = old.seq, "superseding open channel");
            old.closer.cancel();
        }

        if let Some(latest) = entry.buffered.clone() {
            // Replay cannot fail: the queue is empty at this point.
            let _ = tx.try_send(latest);
        }

        entry.channel = Some(ChannelHandle {
            seq,
            tx,
            closer: closer.clone(),
        });
        entry.ever_attached = true;
        entry.session.last_activity_at = Utc::now();

        debug!(session_id, seq, "channel attached");
        Ok(ChannelAttachment {
            rx,
            superseded: closer,
            seq,
        })
    }

    /// Unbind a channel, if it is still the one identified by `seq`.
    ///
    /// A supersession may already have replaced it; in that case this is
    /// a no-op so the old connection's teardown cannot evict its successor.
    pub async fn detach_channel(&self, session_id: &str, seq: u64) {
        let Some(entry_ref) = self.entry(session_id) else {
            return;
        };
        let mut entry = entry_ref.lock().await;
        if entry.channel.as_ref().is_some_and(|ch| ch.seq == seq) {
            entry.channel = None;
            debug!(session_id, seq, "channel detached");
        }
    }

    /// Publish a progress message for a session.
    ///
    /// Keepalives are forwarded (when a channel is attached) without
    /// touching session state. Non-keepalive messages advance the state
    /// machine, must be non-decreasing in `progress`, and are rejected
    /// once the session is terminal. Terminal messages route through
    /// [`finalize`](Self::finalize) internally so the exactly-once
    /// transition holds regardless of the delivery path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown sessions and
    /// `AppError::Validation` for regressions or post-terminal publishes.
    pub async fn publish(&self, session_id: &str, message: ProgressMessage) -> Result<()> {
        message.validate()?;
        let entry_ref = self
            .entry(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;

        let mut entry = entry_ref.lock().await;
        entry.session.last_activity_at = Utc::now();

        if message.is_keepalive() {
            forward(&mut entry, message);
            return Ok(());
        }

        if entry.session.state.is_terminal() {
            return Err(AppError::Validation(format!(
                "session {session_id} is already terminal"
            )));
        }

        // An ERROR terminal carries progress 0 and is exempt from the
        // monotonicity rule; everything else must not move backwards.
        if !message.status.is_terminal() && message.progress < entry.session.progress {
            return Err(AppError::Validation(format!(
                "progress regression: {} < {}",
                message.progress, entry.session.progress
            )));
        }

        match message.status {
            ProgressStatus::Completed => {
                let result = message.result.clone().unwrap_or(serde_json::Value::Null);
                Self::finalize_locked(&mut entry, Ok(result));
                return Ok(());
            }
            ProgressStatus::Error => {
                let category = message
                    .details
                    .get("category")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("pipeline")
                    .to_owned();
                Self::finalize_locked(
                    &mut entry,
                    Err(SessionError {
                        category,
                        message: message.message.clone(),
                    }),
                );
                return Ok(());
            }
            _ => {}
        }

        if let Some(next) = SessionState::from_status(message.status) {
            if entry.session.state != next && !entry.session.can_transition_to(next) {
                return Err(AppError::Validation(format!(
                    "invalid transition {:?} -> {next:?}",
                    entry.session.state
                )));
            }
            entry.session.state = next;
        }
        entry.session.progress = message.progress;

        entry.buffered = Some(message.clone());
        forward(&mut entry, message);
        Ok(())
    }

    /// Transition a session to its terminal state exactly once.
    ///
    /// A second call is a no-op logged as a warning, never an error to
    /// the caller.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session id.
    pub async fn finalize(
        &self,
        session_id: &str,
        outcome: std::result::Result<serde_json::Value, SessionError>,
    ) -> Result<Session> {
        let entry_ref = self
            .entry(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;

        let mut entry = entry_ref.lock().await;
        Self::finalize_locked(&mut entry, outcome);
        Ok(entry.session.clone())
    }

    fn finalize_locked(
        entry: &mut SessionEntry,
        outcome: std::result::Result<serde_json::Value, SessionError>,
    ) {
        if entry.session.state.is_terminal() {
            warn!(
                session_id = %entry.session.session_id,
                state = ?entry.session.state,
                "finalize called on terminal session; ignoring"
            );
            return;
        }

        let session_id = entry.session.session_id.clone();
        let terminal = match outcome {
            Ok(result) => {
                entry.session.state = SessionState::Completed;
                entry.session.progress = 100;
                entry.session.result = Some(result.clone());
                ProgressMessage::completed(session_id.clone(), result)
            }
            Err(error) => {
                entry.session.state = SessionState::Error;
                entry.session.error = Some(error.clone());
                ProgressMessage::failed(session_id.clone(), error.category, error.message)
            }
        };

        let now = Utc::now();
        entry.session.last_activity_at = now;
        entry.terminal_at = Some(now);
        entry.buffered = Some(terminal.clone());
        forward(entry, terminal);
        info!(session_id = %session_id, state = ?entry.session.state, "session finalized");
    }

    /// Read-only snapshot of a session, if present.
    pub async fn snapshot(&self, session_id: &str) -> Option<Session> {
        let entry_ref = self.entry(session_id)?;
        let entry = entry_ref.lock().await;
        Some(entry.session.clone())
    }

    /// Number of sessions currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the registry holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired sessions; returns how many were evicted.
    ///
    /// Evicts terminal sessions whose terminal timestamp is older than the
    /// retention window, and `CREATED` sessions that outlived the staging
    /// timeout without a channel ever attaching.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let candidates: Vec<(String, EntryRef)> = {
            let map = self
                .sessions
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };

        let mut expired = Vec::new();
        for (id, entry_ref) in candidates {
            let entry = entry_ref.lock().await;
            if self.is_expired(&entry, now) {
                if let Some(ch) = &entry.channel {
                    ch.closer.cancel();
                }
                expired.push(id);
            }
        }

        let mut map = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for id in &expired {
            map.remove(id);
            debug!(session_id = %id, "session evicted");
        }
        expired.len()
    }

    fn is_expired(&self, entry: &SessionEntry, now: DateTime<Utc>) -> bool {
        if let Some(terminal_at) = entry.terminal_at {
            let age = now.signed_duration_since(terminal_at);
            return age.to_std().is_ok_and(|age| age > self.retention);
        }
        if entry.session.state == SessionState::Created && !entry.ever_attached {
            let age = now.signed_duration_since(entry.session.created_at);
            return age.to_std().is_ok_and(|age| age > self.staging);
        }
        false
    }

    fn entry(&self, session_id: &str) -> Option<EntryRef> {
        let map = self
            .sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(session_id).map(Arc::clone)
    }
}

/// Forward a message into the attached channel without blocking.
///
/// Delivery order is preserved by the mpsc queue. A full or closed queue
/// drops the channel handle; the message stays in `buffered` (when
/// non-keepalive) so the next attach still sees the current state.
fn forward(entry: &mut SessionEntry, message: ProgressMessage) {
    let Some(ch) = &entry.channel else {
        return;
    };
    match ch.tx.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                session_id = %entry.session.session_id,
                "channel queue full; dropping handle and buffering latest"
            );
            entry.channel = None;
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(
                session_id = %entry.session.session_id,
                "channel receiver gone; buffering latest"
            );
            entry.channel = None;
        }
    }
}
