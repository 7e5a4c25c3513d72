//! Thin stage-reporting API for the generation pipeline.
//!
//! The pipeline never touches the registry directly; it reports stage
//! transitions through a [`StageReporter`], which builds well-formed
//! [`ProgressMessage`]s and hands them to the registry for forwarding to
//! the open progress channel.

use std::sync::Arc;

use tracing::debug;

use crate::models::progress::{ProgressMessage, ProgressStatus};
use crate::models::session::SessionError;
use crate::registry::SessionRegistry;
use crate::Result;

/// Stage-transition reporter bound to one session.
#[derive(Debug, Clone)]
pub struct StageReporter {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl StageReporter {
    /// Bind a reporter to a session.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, session_id: impl Into<String>) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
        }
    }

    /// Session this reporter publishes for.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Report a pipeline stage transition.
    ///
    /// # Errors
    ///
    /// Propagates registry rejections (unknown session, progress
    /// regression, post-terminal publish).
    pub async fn stage(
        &self,
        status: ProgressStatus,
        progress: i32,
        message: impl Into<String>,
    ) -> Result<()> {
        let msg = ProgressMessage::stage(&self.session_id, status, progress, message);
        debug!(session_id = %self.session_id, ?status, progress, "stage reported");
        self.registry.publish(&self.session_id, msg).await
    }

    /// Report a `GENERATING` sub-stage with step bookkeeping.
    ///
    /// # Errors
    ///
    /// Propagates registry rejections.
    pub async fn step(
        &self,
        progress: i32,
        current_step: impl Into<String>,
        completed: u32,
        total: u32,
        message: impl Into<String>,
    ) -> Result<()> {
        let msg = ProgressMessage::stage(
            &self.session_id,
            ProgressStatus::Generating,
            progress,
            message,
        )
        .with_step(current_step, completed, total);
        self.registry.publish(&self.session_id, msg).await
    }

    /// Report terminal success with the result payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn complete(&self, result: serde_json::Value) -> Result<()> {
        self.registry
            .finalize(&self.session_id, Ok(result))
            .await
            .map(|_| ())
    }

    /// Report terminal failure with a category and message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn fail(
        &self,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<()> {
        self.registry
            .finalize(
                &self.session_id,
                Err(SessionError {
                    category: category.into(),
                    message: message.into(),
                }),
            )
            .await
            .map(|_| ())
    }
}
