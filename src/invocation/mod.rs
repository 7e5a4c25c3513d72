//! Invocation URI codec.
//!
//! Parses and builds the custom-scheme URI that bridges the browser UI to
//! the native worker process:
//!
//! ```text
//! paperflow://<operation>?sessionId=<id>&<op-specific-params>
//! ```
//!
//! The codec is a pure function layer: no side effects, deterministic,
//! safe to fuzz. Everything beyond the fixed scheme, the operation, and
//! the mandatory `sessionId` parameter is opaque to it.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use url::Url;

use crate::{AppError, Result};

/// The fixed application URI scheme.
pub const SCHEME: &str = "paperflow";

/// Mandatory parameter naming the session the worker reports into.
pub const PARAM_SESSION_ID: &str = "sessionId";

/// Operation-specific parameter: repository to diff.
pub const PARAM_REPO_PATH: &str = "repoPath";

/// Operation-specific parameter: parsed source document.
pub const PARAM_HTML_PATH: &str = "htmlPath";

/// Operation-specific parameter: server base URL for the progress channel.
pub const PARAM_SERVER_URL: &str = "serverUrl";

/// Closed set of workflows a worker can be asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Multi-stage generation keyed by session id.
    FullGenerate,
    /// Single-stage generation keyed by a short-lived request id.
    SingleGenerate,
}

impl Operation {
    /// Wire name used as the URI authority component.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullGenerate => "full-generate",
            Self::SingleGenerate => "single-generate",
        }
    }

    /// Parse a wire name back into an operation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unrecognized names.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "full-generate" => Ok(Self::FullGenerate),
            "single-generate" => Ok(Self::SingleGenerate),
            other => Err(AppError::Validation(format!(
                "unrecognized operation: {other}"
            ))),
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable value parsed from an invocation URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationUri {
    /// The requested workflow.
    pub operation: Operation,
    /// Mandatory session identifier.
    pub session_id: String,
    /// Remaining operation-specific parameters, percent-decoded.
    pub params: BTreeMap<String, String>,
}

impl InvocationUri {
    /// Start building an invocation for `operation` and `session_id`.
    #[must_use]
    pub fn new(operation: Operation, session_id: impl Into<String>) -> Self {
        Self {
            operation,
            session_id: session_id.into(),
            params: BTreeMap::new(),
        }
    }

    /// Attach an operation-specific parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up an operation-specific parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Render the URI text handed to the OS scheme handler.
    ///
    /// Reserved characters in values (`&`, `=`, spaces, non-ASCII) are
    /// percent-encoded so the parser never splits them incorrectly.
    #[must_use]
    pub fn to_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair(PARAM_SESSION_ID, &self.session_id);
        for (key, value) in &self.params {
            query.append_pair(key, value);
        }
        format!("{SCHEME}://{}?{}", self.operation, query.finish())
    }
}

/// Parse raw URI text into an [`InvocationUri`].
///
/// # Errors
///
/// Returns `AppError::Validation` when the scheme is not `paperflow`, the
/// operation is absent or unrecognized, or `sessionId` is missing/empty.
pub fn parse(raw: &str) -> Result<InvocationUri> {
    let url =
        Url::parse(raw).map_err(|err| AppError::Validation(format!("malformed URI: {err}")))?;

    if url.scheme() != SCHEME {
        return Err(AppError::Validation(format!(
            "unexpected scheme '{}', expected '{SCHEME}'",
            url.scheme()
        )));
    }

    let operation = url
        .host_str()
        .ok_or_else(|| AppError::Validation("missing operation".into()))
        .and_then(Operation::parse)?;

    let mut session_id = None;
    let mut params = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        if key == PARAM_SESSION_ID {
            session_id = Some(value.into_owned());
        } else {
            params.insert(key.into_owned(), value.into_owned());
        }
    }

    let session_id = session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::Validation(format!("missing or empty {PARAM_SESSION_ID}")))?;

    Ok(InvocationUri {
        operation,
        session_id,
        params,
    })
}
