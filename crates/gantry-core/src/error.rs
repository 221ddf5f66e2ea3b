//! Error types for the gantry crates

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

// ─────────────────────────────────────────────────────────────────
// Problem codes
// ─────────────────────────────────────────────────────────────────

/// Transport-level failure codes carried by [`EngineError::problem`].
pub mod problem {
    pub const AUTHENTICATION_FAILED: &str = "authentication-failed";
    pub const ACCESS_DENIED: &str = "access-denied";
    pub const NOT_FOUND: &str = "not-found";
    pub const INTERNAL_ERROR: &str = "internal-error";
    pub const TIMEOUT: &str = "timeout";
    pub const DISCONNECTED: &str = "disconnected";
}

/// Map an HTTP status code to a transport problem code.
pub fn status_problem(status: u16) -> &'static str {
    match status {
        401 => problem::AUTHENTICATION_FAILED,
        403 => problem::ACCESS_DENIED,
        404 => problem::NOT_FOUND,
        _ => problem::INTERNAL_ERROR,
    }
}

/// Map an IO error kind to a transport problem code.
///
/// A missing or refusing socket reads as `not-found` (the engine instance is
/// not there), a permission failure as `access-denied`; anything else is a
/// lost channel.
pub fn io_problem(kind: std::io::ErrorKind) -> &'static str {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => problem::NOT_FOUND,
        ErrorKind::PermissionDenied => problem::ACCESS_DENIED,
        ErrorKind::TimedOut => problem::TIMEOUT,
        _ => problem::DISCONNECTED,
    }
}

// ─────────────────────────────────────────────────────────────────
// EngineError
// ─────────────────────────────────────────────────────────────────

/// Structured failure reported for one engine exchange.
///
/// Transport-level fields (`problem`, `status`) are filled in by the client
/// from the HTTP status or IO failure; body-derived fields (`message`,
/// `reason`, `cause` and anything else the API sent) are merged in by
/// [`EngineError::normalize`]. Body fields win on key collision because they
/// are merged last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    /// Short transport failure code, see [`problem`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    /// HTTP status code, when the failure came from a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Additional body fields the API reported beyond the well-known ones.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EngineError {
    /// Transport-level error with just a problem code and a message.
    pub fn transport(problem: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            problem: Some(problem.into()),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Transport error for an HTTP error response, before body merging.
    pub fn from_status(status: u16, reason: &str) -> Self {
        let reason = (!reason.is_empty()).then(|| reason.to_string());
        Self {
            problem: Some(status_problem(status).to_string()),
            status: Some(status),
            message: reason.clone(),
            reason,
            ..Self::default()
        }
    }

    /// Transport error for a channel-level IO failure.
    pub fn from_io(err: &std::io::Error) -> Self {
        Self::transport(io_problem(err.kind()), err.to_string())
    }

    /// Merge a response body into this transport error.
    ///
    /// A body that parses as a JSON object has its fields shallow-merged over
    /// the transport fields (`message`/`reason`/`cause` land in the typed
    /// fields, the rest in `extra`). A body that is readable text but not a
    /// JSON object becomes the `message` wholesale. An empty or unreadable
    /// body leaves the error unchanged, with a logged diagnostic, since it
    /// means the transport broke its own contract. Never fails.
    pub fn normalize(mut self, content: &[u8]) -> Self {
        if content.is_empty() {
            return self;
        }
        let text = match std::str::from_utf8(content) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(error = %err, "engine error body is not text, keeping transport error");
                return self;
            }
        };
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => {
                for (key, value) in fields {
                    self.set_field(key, value);
                }
            }
            Ok(_) => {
                // Valid JSON without fields (number, string, array) has
                // nothing to merge.
                tracing::debug!(body = text, "engine error body is JSON but not an object");
            }
            Err(_) => {
                self.message = Some(text.to_string());
            }
        }
        self
    }

    fn set_field(&mut self, key: String, value: Value) {
        match (key.as_str(), &value) {
            ("message", Value::String(message)) => self.message = Some(message.clone()),
            ("reason", Value::String(reason)) => self.reason = Some(reason.clone()),
            ("cause", Value::String(cause)) => self.cause = Some(cause.clone()),
            _ => {
                self.extra.insert(key, value);
            }
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self
            .message
            .as_deref()
            .or(self.reason.as_deref())
            .or(self.problem.as_deref())
            .unwrap_or("engine request failed");
        match self.status {
            Some(status) => write!(f, "{summary} (status {status})"),
            None => f.write_str(summary),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Error enum
// ─────────────────────────────────────────────────────────────────

/// Gantry error types organized by layer
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Address/Environment Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Address error: {message}")]
    Address { message: String },

    // ─────────────────────────────────────────────────────────────
    // Engine/Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection closed")]
    Closed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn address(message: impl Into<String>) -> Self {
        Self::Address {
            message: message.into(),
        }
    }

    pub fn engine(error: EngineError) -> Self {
        Self::Engine(error)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// The engine's problem code, when this is a transport-level failure.
    pub fn engine_problem(&self) -> Option<&str> {
        match self {
            Error::Engine(engine) => engine.problem.as_deref(),
            _ => None,
        }
    }

    /// Check whether this error reports a missing object (HTTP 404 or a
    /// `not-found` channel failure). The `exists` endpoints rely on this.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Engine(engine) => {
                engine.status == Some(404) || engine.problem.as_deref() == Some(problem::NOT_FOUND)
            }
            _ => false,
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Engine(_)
                | Error::Protocol { .. }
                | Error::Timeout(_)
                | Error::Closed
                | Error::ChannelClosed
        )
    }

    /// Check if this error indicates a broken environment rather than a
    /// failed exchange
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Address { .. })
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
