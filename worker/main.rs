#![forbid(unsafe_code)]

//! `paperflow-worker` — short-lived generation worker.
//!
//! Invoked by the OS when a `paperflow://` URI is opened: the full URI
//! arrives as the sole positional argument. The worker parses it, opens
//! a publisher progress channel back to the server named by `serverUrl`,
//! drives the generation pipeline, emits the terminal message, and exits.
//!
//! Exit codes: `0` after a terminal `COMPLETED` message; `1` on any
//! failure path (the reason has already been sent as a terminal `ERROR`
//! message when a channel connection was achieved); `2` when the URI
//! itself is invalid and no channel was possible.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use paperflow::channel::client::ProgressPublisher;
use paperflow::channel::protocol::ChannelTuning;
use paperflow::config::GlobalConfig;
use paperflow::invocation::{self, InvocationUri, Operation, PARAM_SERVER_URL};
use paperflow::models::progress::{ProgressMessage, ProgressStatus};
use paperflow::pipeline::script::ScriptPipeline;
use paperflow::pipeline::{Pipeline, PipelineContext};
use paperflow::AppError;

#[derive(Debug, Parser)]
#[command(name = "paperflow-worker", about = "Paperflow generation worker", version, long_about = None)]
struct Cli {
    /// The full `paperflow://` invocation URI handed over by the OS.
    uri: String,

    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing();

    // URI validation happens before anything else; without a session id
    // there is no channel to report into.
    let uri = match invocation::parse(&args.uri) {
        Ok(uri) => uri,
        Err(err) => {
            eprintln!("invalid invocation URI: {err}");
            return ExitCode::from(2);
        }
    };

    let config = match load_config(args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(uri, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "worker run failed");
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> paperflow::Result<GlobalConfig> {
    match path {
        Some(path) => GlobalConfig::load_from_path(path),
        None => Ok(GlobalConfig::default()),
    }
}

async fn run(uri: InvocationUri, config: GlobalConfig) -> paperflow::Result<()> {
    let session_id = uri.session_id.clone();
    let server_url = uri
        .param(PARAM_SERVER_URL)
        .ok_or_else(|| AppError::Validation(format!("missing {PARAM_SERVER_URL} parameter")))?;
    let channel_url = channel_url(server_url, uri.operation, &session_id);
    let tuning = ChannelTuning::from(&config.timeouts);

    info!(session_id, operation = %uri.operation, "worker starting");

    let publisher =
        ProgressPublisher::connect(channel_url, session_id.clone(), tuning).await?;

    publisher
        .send(ProgressMessage::stage(
            &session_id,
            ProgressStatus::Received,
            0,
            "invocation received",
        ))
        .await?;

    let ctx = PipelineContext {
        session_id: session_id.clone(),
        operation: uri.operation,
        params: uri.params.clone(),
    };
    let pipeline = ScriptPipeline::new(config.generator.clone());

    let outcome = pipeline.run(&ctx, &publisher).await;

    let (terminal, run_result) = match outcome {
        Ok(result) => (
            ProgressMessage::completed(&session_id, result),
            Ok(()),
        ),
        Err(AppError::Pipeline { category, message }) => (
            ProgressMessage::failed(&session_id, category.clone(), message.clone()),
            Err(AppError::Pipeline { category, message }),
        ),
        Err(err) => (
            ProgressMessage::failed(&session_id, "worker", err.to_string()),
            Err(err),
        ),
    };

    publisher.send(terminal).await?;
    publisher.finish().await?;

    info!(session_id, success = run_result.is_ok(), "worker finished");
    run_result
}

/// Route the publisher onto the channel shape matching the operation.
fn channel_url(server_url: &str, operation: Operation, session_id: &str) -> String {
    let base = server_url.trim_end_matches('/');
    match operation {
        Operation::FullGenerate => {
            format!("{base}/ws/sessions/{session_id}/progress?role=publisher")
        }
        Operation::SingleGenerate => format!("{base}/ws/generate/{session_id}?role=publisher"),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Diagnostics go to stderr so a channel-less failure still leaves a trace.
    let _ = fmt().with_env_filter(env_filter).with_writer(std::io::stderr).try_init();
}
