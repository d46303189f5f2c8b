//! Error types shared by the protocol, codec and cursor layers.

use serde::Serialize;
use thiserror::Error;

/// Failures of the extended JSON codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A `$date` marker did not hold a representable millisecond timestamp.
    #[error("invalid $date value: {0}")]
    InvalidDate(String),
    /// A `$binary` marker did not hold valid base64.
    #[error("invalid $binary value: {0}")]
    InvalidBinary(String),
    /// A `$InfNaN` marker held something other than `1`, `-1` or `0`.
    #[error("invalid $InfNaN value: {0}")]
    InvalidInfNaN(String),
    /// A `$escape` marker did not wrap an object.
    #[error("invalid $escape value")]
    InvalidEscape,
    /// A `$type`/`$value` custom type that this codec does not know.
    #[error("unsupported custom type '{0}'")]
    UnsupportedType(String),
}

/// Protocol violations raised while handling a well-formed frame.
///
/// These are reported to the client as `error` frames with the reason
/// `"[<msg>]: <message>"`; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// `id` missing, empty or not a string.
    #[error("ID is not specified")]
    MissingId,
    /// `method` missing, empty or not a string.
    #[error("Method is not specified")]
    MissingMethod,
    /// `name` missing, empty or not a string.
    #[error("Name is not specified")]
    MissingName,
    /// `params` present but not an array.
    #[error("Invalid 'params' parameter")]
    InvalidParams,
    /// No publication registered under the requested name.
    #[error("No subscription found with the name '{0}'")]
    UnknownPublication(String),
    /// The subscription id is already live on this connection.
    #[error("Subscription '{0}' is already active")]
    DuplicateSubscription(String),
    /// The publication handler returned an error.
    #[error("{0}")]
    PublicationFailed(String),
    /// The publication handler panicked.
    #[error("Publication '{0}' panicked")]
    PublicationPanicked(String),
}

/// Failures reported by cursor backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// The initial snapshot can only be read once.
    #[error("cursor snapshot has already been consumed")]
    SnapshotConsumed,
    /// The cursor was already closed.
    #[error("cursor is closed")]
    Closed,
    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// A method failure, rendered on the wire as `{error, message}`.
///
/// `kind` plays the role of an error class name: the `error` field is
/// `"<kind>: <message>"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct MethodError {
    /// Error class name, `"Error"` unless a handler chooses otherwise.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// Wire body of a failed `result` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodErrorBody {
    /// `"<kind>: <message>"`.
    pub error: String,
    /// The bare message.
    pub message: String,
}

impl MethodError {
    /// Plain `Error` with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind("Error", message)
    }

    /// Error with a custom class name.
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The error sent for a method name with no registered handler.
    pub fn not_found(method: &str) -> Self {
        Self::new(format!("Method not found ('{method}')"))
    }

    /// The error sent when a pending method exceeds its time budget.
    pub fn timed_out(method: &str) -> Self {
        Self::new(format!("Method '{method}' timed out"))
    }

    /// The error sent when a handler panics.
    pub fn panicked(method: &str) -> Self {
        Self::new(format!("Method '{method}' panicked"))
    }

    /// Wire representation.
    pub fn to_body(&self) -> MethodErrorBody {
        MethodErrorBody {
            error: self.to_string(),
            message: self.message.clone(),
        }
    }
}

impl From<CursorError> for MethodError {
    fn from(err: CursorError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
