//! Shared progress-channel protocol rules.
//!
//! Both endpoints speak JSON-encoded
//! [`ProgressMessage`](crate::models::progress::ProgressMessage) text
//! frames. Keepalive traffic is client-driven: the client pings at a
//! cadence strictly shorter than the server's idle interval and the
//! server echoes a pong frame that must never surface as progress.

use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::models::progress::ProgressMessage;

/// WebSocket close code for a deliberate, clean shutdown.
///
/// A close carrying this code, or any close after a terminal message,
/// must not trigger reconnection.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code the server uses when the idle deadline passes.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4000;

/// Close code the server uses when a newer channel supersedes this one.
pub const CLOSE_SUPERSEDED: u16 = 4001;

/// Free-text body of the client keepalive ping frame.
pub const PING_TEXT: &str = "ping";

/// Free-text body of the server keepalive pong echo.
pub const PONG_TEXT: &str = "pong";

/// Connection-housekeeping phrases suppressed from user-facing progress.
///
/// Some publishers only set the free-text field on their housekeeping
/// frames, so the filter matches these in addition to the strict
/// `KEEPALIVE` tag.
pub const HOUSEKEEPING_PHRASES: &[&str] = &[
    PING_TEXT,
    PONG_TEXT,
    "keepalive",
    "connection established",
    "connection refreshed",
];

/// Client-side tuning derived from the `[timeouts]` configuration table.
#[derive(Debug, Clone, Copy)]
pub struct ChannelTuning {
    /// Keepalive ping cadence; strictly shorter than the server idle
    /// interval.
    pub ping_interval: Duration,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Maximum reconnect attempts before surfacing a connectivity error.
    pub max_reconnect_attempts: u32,
}

impl From<&TimeoutConfig> for ChannelTuning {
    fn from(timeouts: &TimeoutConfig) -> Self {
        Self {
            ping_interval: timeouts.ping_interval(),
            reconnect_delay: timeouts.reconnect_delay(),
            max_reconnect_attempts: timeouts.max_reconnect_attempts,
        }
    }
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

/// Whether a message is connection housekeeping rather than progress.
///
/// True when the keepalive tag is set (`status = KEEPALIVE` or
/// `progress = -1`) or the free-text body matches one of the known
/// housekeeping phrases. System messages still reset liveness timers;
/// they are only excluded from user-facing rendering.
#[must_use]
pub fn is_system_message(message: &ProgressMessage) -> bool {
    if message.is_keepalive() {
        return true;
    }
    let text = message.message.trim().to_lowercase();
    HOUSEKEEPING_PHRASES.iter().any(|phrase| text == *phrase)
}

/// Whether a close code should trigger the reconnect policy.
#[must_use]
pub fn should_reconnect(close_code: Option<u16>) -> bool {
    close_code != Some(CLOSE_NORMAL)
}
