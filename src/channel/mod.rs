//! Progress channel: the real-time connection delivering
//! [`ProgressMessage`](crate::models::progress::ProgressMessage)s for one
//! session.
//!
//! `server` hosts the axum WebSocket endpoints and the REST surface;
//! `client` is the reconnecting subscriber/publisher used by the worker
//! binary and by tests; `protocol` holds the pieces both sides share
//! (close-code rules, channel tuning, system-message filter).

pub mod client;
pub mod protocol;
pub mod server;
