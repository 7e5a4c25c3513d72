//! Session model and lifecycle helpers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::progress::ProgressStatus;

/// Lifecycle state for a generation session.
///
/// `KEEPALIVE` traffic on a progress channel never maps to one of these;
/// it is a wire-level heartbeat only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Metadata staged, no pipeline started.
    Created,
    /// Worker picked up the invocation.
    Received,
    /// Parsing and analyzing the source documents.
    AnalyzingSource,
    /// Optional context-indexing stage.
    StoringContext,
    /// Rendering output documents; sub-stages via `current_step`.
    Generating,
    /// Terminal success; `result` is populated.
    Completed,
    /// Terminal failure; `error` is populated.
    Error,
}

impl SessionState {
    /// Whether this state ends the session lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Map a wire status onto a session state, if it names one.
    ///
    /// Returns `None` for [`ProgressStatus::Keepalive`], which never
    /// changes session state.
    #[must_use]
    pub fn from_status(status: ProgressStatus) -> Option<Self> {
        match status {
            ProgressStatus::Received => Some(Self::Received),
            ProgressStatus::AnalyzingSource => Some(Self::AnalyzingSource),
            ProgressStatus::StoringContext => Some(Self::StoringContext),
            ProgressStatus::Generating => Some(Self::Generating),
            ProgressStatus::Completed => Some(Self::Completed),
            ProgressStatus::Error => Some(Self::Error),
            ProgressStatus::Keepalive => None,
        }
    }
}

/// Terminal error recorded on a failed session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionError {
    /// Stable machine-readable failure category.
    pub category: String,
    /// Human-readable failure description.
    pub message: String,
}

/// Session domain entity held in the in-memory registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Caller-supplied identifier, unique per logical run.
    pub session_id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last state change or published message.
    pub last_activity_at: DateTime<Utc>,
    /// Opaque key/value metadata supplied at creation
    /// (e.g. parsed document title and fields).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Repository the generation run operates on.
    pub repo_path: Option<String>,
    /// Output identifiers / download references; terminal `COMPLETED` only.
    pub result: Option<serde_json::Value>,
    /// Failure details; terminal `ERROR` only.
    pub error: Option<SessionError>,
    /// Highest non-keepalive progress value published so far.
    pub progress: i32,
}

impl Session {
    /// Construct a new session in `CREATED` state.
    #[must_use]
    pub fn new(
        session_id: String,
        metadata: HashMap<String, String>,
        repo_path: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            state: SessionState::Created,
            created_at: now,
            last_activity_at: now,
            metadata,
            repo_path,
            result: None,
            error: None,
            progress: 0,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Pipeline stages only move forward; `STORING_CONTEXT` is optional
    /// and may be skipped. Any non-terminal state may fail to `ERROR`.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        match next {
            SessionState::Created => false,
            SessionState::Error => true,
            SessionState::Received => self.state == SessionState::Created,
            SessionState::AnalyzingSource => {
                matches!(self.state, SessionState::Created | SessionState::Received)
            }
            SessionState::StoringContext => self.state == SessionState::AnalyzingSource,
            SessionState::Generating => matches!(
                self.state,
                SessionState::Received
                    | SessionState::AnalyzingSource
                    | SessionState::StoringContext
                    | SessionState::Generating
            ),
            SessionState::Completed => self.state == SessionState::Generating,
        }
    }
}
