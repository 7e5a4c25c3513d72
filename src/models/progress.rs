//! Progress message wire types for session channels.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Sentinel `progress` value marking a keepalive rather than a real
/// progress percentage.
pub const KEEPALIVE_PROGRESS: i32 = -1;

/// Wire status carried on every [`ProgressMessage`].
///
/// Mirrors [`SessionState`](crate::models::session::SessionState) for the
/// pipeline stages and adds the channel-only `KEEPALIVE` value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    /// Worker picked up the invocation.
    Received,
    /// Parsing and analyzing the source documents.
    AnalyzingSource,
    /// Optional context-indexing stage.
    StoringContext,
    /// Rendering output documents.
    Generating,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Error,
    /// Connection heartbeat; never a session state.
    Keepalive,
}

impl ProgressStatus {
    /// Whether this status terminates the message stream for a session.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// The wire unit exchanged over a progress channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ProgressMessage {
    /// Session this message belongs to.
    pub session_id: String,
    /// Pipeline stage or `KEEPALIVE`.
    pub status: ProgressStatus,
    /// Human-readable progress description.
    pub message: String,
    /// 0–100, or [`KEEPALIVE_PROGRESS`] for heartbeats.
    pub progress: i32,
    /// Name of the current sub-stage within `GENERATING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Sub-stages finished so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_completed: Option<u32>,
    /// Total sub-stages for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    /// Opaque details such as timing metrics.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
    /// Output references; present only on terminal `COMPLETED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ProgressMessage {
    /// Build a pipeline stage message.
    #[must_use]
    pub fn stage(
        session_id: impl Into<String>,
        status: ProgressStatus,
        progress: i32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            status,
            message: message.into(),
            progress,
            current_step: None,
            steps_completed: None,
            total_steps: None,
            details: HashMap::new(),
            result: None,
        }
    }

    /// Build a tagged keepalive frame (`status = KEEPALIVE`, `progress = -1`).
    #[must_use]
    pub fn keepalive(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::stage(
            session_id,
            ProgressStatus::Keepalive,
            KEEPALIVE_PROGRESS,
            text,
        )
    }

    /// Build the terminal `COMPLETED` message carrying the result payload.
    #[must_use]
    pub fn completed(session_id: impl Into<String>, result: serde_json::Value) -> Self {
        let mut msg = Self::stage(
            session_id,
            ProgressStatus::Completed,
            100,
            "generation complete",
        );
        msg.result = Some(result);
        msg
    }

    /// Build the terminal `ERROR` message for a pipeline failure.
    #[must_use]
    pub fn failed(
        session_id: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut msg = Self::stage(session_id, ProgressStatus::Error, 0, message);
        msg.details.insert(
            "category".into(),
            serde_json::Value::String(category.into()),
        );
        msg
    }

    /// Attach sub-stage bookkeeping to a `GENERATING` message.
    #[must_use]
    pub fn with_step(mut self, current_step: impl Into<String>, completed: u32, total: u32) -> Self {
        self.current_step = Some(current_step.into());
        self.steps_completed = Some(completed);
        self.total_steps = Some(total);
        self
    }

    /// Whether this frame is tagged as a heartbeat.
    ///
    /// Tag-based only; the channel layer adds the free-text heuristic on top
    /// (see [`crate::channel::protocol::is_system_message`]).
    #[must_use]
    pub fn is_keepalive(&self) -> bool {
        self.status == ProgressStatus::Keepalive || self.progress == KEEPALIVE_PROGRESS
    }

    /// Validate field consistency before publishing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the progress value is out of range
    /// for the status, or a result payload rides on a non-terminal message.
    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(AppError::Validation("session_id must not be empty".into()));
        }
        if self.is_keepalive() {
            return Ok(());
        }
        if !(0..=100).contains(&self.progress) {
            return Err(AppError::Validation(format!(
                "progress {} out of range 0-100",
                self.progress
            )));
        }
        if self.result.is_some() && self.status != ProgressStatus::Completed {
            return Err(AppError::Validation(
                "result is only valid on a terminal COMPLETED message".into(),
            ));
        }
        Ok(())
    }
}
