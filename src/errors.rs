//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed invocation URI or missing/invalid parameters.
    ///
    /// Rejected before any registry mutation or process launch.
    Validation(String),
    /// A non-terminal, non-expired session already exists for the id.
    DuplicateSession(String),
    /// Progress channel dropped and reconnect attempts were exhausted.
    Connectivity(String),
    /// Worker process could not be started or superseded.
    Launch(String),
    /// Failure inside a generation pipeline stage, with a category tag.
    Pipeline {
        /// Stable machine-readable failure category (e.g. `llm`, `render`).
        category: String,
        /// Human-readable failure description.
        message: String,
    },
    /// Progress channel framing or protocol failure.
    Channel(String),
    /// Requested session or lock record does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::DuplicateSession(msg) => write!(f, "duplicate session: {msg}"),
            Self::Connectivity(msg) => write!(f, "connectivity: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Pipeline { category, message } => write!(f, "pipeline ({category}): {message}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Build an [`AppError::Pipeline`] from a category and message.
    #[must_use]
    pub fn pipeline(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pipeline {
            category: category.into(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Channel(format!("invalid message payload: {err}"))
    }
}
