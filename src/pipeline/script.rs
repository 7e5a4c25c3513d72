//! Script-backed pipeline.
//!
//! Runs the configured generator command as a child process and decodes
//! newline-delimited JSON stage events from its stdout. The generator
//! receives its run parameters through `PAPERFLOW_*` environment
//! variables and must emit one [`StageEvent`](super::StageEvent) per
//! line, ending with a terminal `COMPLETED` or `ERROR` event.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::process::Command;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::{Pipeline, PipelineContext, StageEvent};
use crate::channel::client::ProgressPublisher;
use crate::config::GeneratorConfig;
use crate::invocation::{PARAM_HTML_PATH, PARAM_REPO_PATH};
use crate::models::progress::{ProgressMessage, ProgressStatus};
use crate::{AppError, Result};

/// Maximum stage-event line length accepted from a generator: 1 MiB.
///
/// Longer lines abort the run rather than allocating unbounded memory
/// for a single event from a misbehaving generator.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// NDJSON codec for generator stdout streams.
///
/// Delegates line-framing to [`LinesCodec`] with the fixed
/// [`MAX_LINE_BYTES`] limit.
#[derive(Debug)]
pub struct StageEventCodec(LinesCodec);

impl StageEventCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for StageEventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StageEventCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => AppError::pipeline(
            "generator",
            format!("stage event line exceeded {MAX_LINE_BYTES} bytes"),
        ),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

/// Pipeline implementation backed by an external generator command.
#[derive(Debug, Clone)]
pub struct ScriptPipeline {
    generator: GeneratorConfig,
}

impl ScriptPipeline {
    /// Build a pipeline around the configured generator.
    #[must_use]
    pub fn new(generator: GeneratorConfig) -> Self {
        Self { generator }
    }

    async fn run_inner(
        &self,
        ctx: &PipelineContext,
        publisher: &ProgressPublisher,
    ) -> Result<serde_json::Value> {
        let mut cmd = Command::new(&self.generator.command);
        cmd.args(&self.generator.args)
            .env("PAPERFLOW_SESSION_ID", &ctx.session_id)
            .env("PAPERFLOW_OPERATION", ctx.operation.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(repo_path) = ctx.params.get(PARAM_REPO_PATH) {
            cmd.env("PAPERFLOW_REPO_PATH", repo_path);
        }
        if let Some(html_path) = ctx.params.get(PARAM_HTML_PATH) {
            cmd.env("PAPERFLOW_HTML_PATH", html_path);
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::pipeline(
                "generator",
                format!("failed to start {}: {err}", self.generator.command),
            )
        })?;

        info!(
            session_id = %ctx.session_id,
            generator = %self.generator.command,
            pid = child.id().unwrap_or(0),
            "generator started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::pipeline("generator", "generator stdout not captured"))?;
        let mut lines = FramedRead::new(stdout, StageEventCodec::new());

        let mut outcome: Option<Result<serde_json::Value>> = None;
        while let Some(line) = lines.next().await {
            let line = line?;
            let event: StageEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, "skipping malformed stage event line");
                    continue;
                }
            };

            match event.status {
                ProgressStatus::Completed => {
                    outcome = Some(Ok(event.result.unwrap_or(serde_json::Value::Null)));
                    break;
                }
                ProgressStatus::Error => {
                    let category = event
                        .details
                        .get("category")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("generator")
                        .to_owned();
                    outcome = Some(Err(AppError::Pipeline {
                        category,
                        message: event.message,
                    }));
                    break;
                }
                ProgressStatus::Keepalive => {
                    debug!(session_id = %ctx.session_id, "generator keepalive");
                }
                status => {
                    let mut message = ProgressMessage::stage(
                        &ctx.session_id,
                        status,
                        event.progress,
                        event.message,
                    );
                    message.current_step = event.current_step;
                    message.steps_completed = event.steps_completed;
                    message.total_steps = event.total_steps;
                    message.details = event.details;
                    publisher.send(message).await?;
                }
            }
        }

        let exit = child.wait().await.map_err(|err| {
            AppError::pipeline("generator", format!("wait on generator failed: {err}"))
        })?;

        match outcome {
            Some(result) => result,
            None if exit.success() => Err(AppError::pipeline(
                "generator",
                "generator exited without a terminal stage event",
            )),
            None => Err(AppError::pipeline(
                "generator",
                format!("generator failed with {exit}"),
            )),
        }
    }
}

impl Pipeline for ScriptPipeline {
    fn run<'a>(
        &'a self,
        ctx: &'a PipelineContext,
        publisher: &'a ProgressPublisher,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>> {
        Box::pin(self.run_inner(ctx, publisher))
    }
}
