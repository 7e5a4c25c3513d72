#![forbid(unsafe_code)]

//! Session coordination core for automated document generation.
//!
//! Ties together three independently-running actors: a browser UI, this
//! long-lived server, and a short-lived worker process invoked through
//! the `paperflow://` URI scheme. The server owns session lifecycle,
//! supervises worker processes (at most one per session), and relays
//! ordered progress over per-session WebSocket channels.

pub mod channel;
pub mod config;
pub mod errors;
pub mod invocation;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod reporter;
pub mod supervisor;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
