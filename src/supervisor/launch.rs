//! Platform launch strategies for worker processes.
//!
//! The browser hands the invocation URI to a native scheme handler whose
//! execution context is restricted (inherited sandbox, short lifetime).
//! Each platform has its own way of escaping that context to produce a
//! fully capable, independently-network-addressable process; all
//! strategies share the same postcondition: the worker is running,
//! detached from the launcher's lifetime, and has received the complete
//! invocation URI as its sole argument.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::info;

use crate::{AppError, Result};

/// One platform's way of launching a detached worker.
pub trait LaunchStrategy: Send + Sync + std::fmt::Debug {
    /// Spawn `worker_bin` with `uri` as its sole argument, detached.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` when the binary is missing, not
    /// executable, or the spawn itself fails.
    fn launch(&self, worker_bin: &str, uri: &str) -> Result<Child>;

    /// Strategy name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Select the strategy for the compile-target platform.
#[must_use]
pub fn platform_strategy() -> Box<dyn LaunchStrategy> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsLaunch)
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(MacLaunch)
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        Box::new(UnixLaunch)
    }
}

fn base_command(worker_bin: &str, uri: &str) -> Command {
    let mut cmd = Command::new(worker_bin);
    cmd.arg(uri)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        // The worker must outlive the launcher; termination goes through
        // the supervisor's escalation policy, never through drop.
        .kill_on_drop(false);
    cmd
}

fn spawn(mut cmd: Command, strategy: &'static str, worker_bin: &str) -> Result<Child> {
    let child = cmd.spawn().map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            AppError::Launch(format!("worker binary not found: {worker_bin}"))
        }
        std::io::ErrorKind::PermissionDenied => {
            AppError::Launch(format!("worker binary not executable: {worker_bin}"))
        }
        _ => AppError::Launch(format!("failed to spawn worker: {err}")),
    })?;
    info!(
        strategy,
        pid = child.id().unwrap_or(0),
        worker_bin,
        "worker process launched"
    );
    Ok(child)
}

/// Linux and other unixes: a new process group (`setsid` semantics)
/// detaches the worker from the browser-owned launcher session, so
/// closing the launcher never delivers SIGHUP to the worker.
#[cfg(all(unix, not(target_os = "macos")))]
#[derive(Debug)]
pub struct UnixLaunch;

#[cfg(all(unix, not(target_os = "macos")))]
impl LaunchStrategy for UnixLaunch {
    fn launch(&self, worker_bin: &str, uri: &str) -> Result<Child> {
        let mut cmd = base_command(worker_bin, uri);
        cmd.process_group(0);
        spawn(cmd, self.name(), worker_bin)
    }

    fn name(&self) -> &'static str {
        "unix-process-group"
    }
}

/// macOS: browsers hand scheme invocations to handlers with sandbox
/// environment injected via `DYLD_*`; scrubbing those plus a fresh
/// process group yields an unrestricted, network-capable worker.
#[cfg(target_os = "macos")]
#[derive(Debug)]
pub struct MacLaunch;

#[cfg(target_os = "macos")]
impl LaunchStrategy for MacLaunch {
    fn launch(&self, worker_bin: &str, uri: &str) -> Result<Child> {
        let mut cmd = base_command(worker_bin, uri);
        cmd.process_group(0)
            .env_remove("DYLD_INSERT_LIBRARIES")
            .env_remove("DYLD_LIBRARY_PATH")
            .env_remove("__CFBundleIdentifier");
        spawn(cmd, self.name(), worker_bin)
    }

    fn name(&self) -> &'static str {
        "macos-scrubbed-env"
    }
}

/// Windows: `DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP` breaks the
/// console and job-object inheritance from the protocol-handler shim.
#[cfg(target_os = "windows")]
#[derive(Debug)]
pub struct WindowsLaunch;

#[cfg(target_os = "windows")]
impl LaunchStrategy for WindowsLaunch {
    fn launch(&self, worker_bin: &str, uri: &str) -> Result<Child> {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        let mut cmd = base_command(worker_bin, uri);
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        spawn(cmd, self.name(), worker_bin)
    }

    fn name(&self) -> &'static str {
        "windows-detached"
    }
}
