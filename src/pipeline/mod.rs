//! Generation pipeline seam.
//!
//! The actual document generation (diff extraction, LLM prompting,
//! template rendering) is an external collaborator. The worker drives it
//! through the narrow [`Pipeline`] trait: implementations stream
//! non-terminal stage transitions through the given publisher and return
//! the terminal outcome, which the worker converts into the final
//! `COMPLETED`/`ERROR` message and its exit code.

pub mod script;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;

use crate::channel::client::ProgressPublisher;
use crate::invocation::Operation;
use crate::models::progress::ProgressStatus;
use crate::Result;

/// Everything a pipeline needs to know about its run.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Session the run reports into.
    pub session_id: String,
    /// Requested workflow.
    pub operation: Operation,
    /// Operation-specific invocation parameters (percent-decoded).
    pub params: BTreeMap<String, String>,
}

/// One stage event emitted by a generator, minus the session id.
///
/// This is the NDJSON line shape the external generator writes to its
/// stdout; the script pipeline stamps the session id on and forwards it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct StageEvent {
    /// Pipeline stage.
    pub status: ProgressStatus,
    /// Human-readable progress description.
    #[serde(default)]
    pub message: String,
    /// 0–100.
    pub progress: i32,
    /// Current sub-stage within `GENERATING`.
    #[serde(default)]
    pub current_step: Option<String>,
    /// Sub-stages finished so far.
    #[serde(default)]
    pub steps_completed: Option<u32>,
    /// Total sub-stages.
    #[serde(default)]
    pub total_steps: Option<u32>,
    /// Opaque details such as timing metrics.
    #[serde(default)]
    pub details: std::collections::HashMap<String, serde_json::Value>,
    /// Output references; terminal `COMPLETED` only.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// Narrow interface to the out-of-scope generation machinery.
///
/// Implementations forward non-terminal stage events through `publisher`
/// and resolve with the `COMPLETED` result payload; failures come back as
/// [`AppError::Pipeline`](crate::AppError::Pipeline) with a category the
/// caller reports in the terminal `ERROR` message.
pub trait Pipeline: Send + Sync {
    /// Run the pipeline to its terminal outcome.
    fn run<'a>(
        &'a self,
        ctx: &'a PipelineContext,
        publisher: &'a ProgressPublisher,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>>;
}
