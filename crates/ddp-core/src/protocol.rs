//! Wire frames: inbound decoding and outbound encoding.
//!
//! Every frame is an EJSON object with a `msg` discriminator. Inbound text is
//! decoded in two steps so that the dispatcher can quote the raw object in
//! error replies:
//!
//! 1. [`decode_frame`] checks the envelope (`msg` present and known).
//! 2. [`Frame::parse`] validates the fields of that kind into a
//!    [`ClientMessage`].

use std::fmt;
use std::num::FpCategory;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::ejson::{self, Fields, NonFinite, Value};
use crate::errors::{CodecError, MethodError, MethodErrorBody, ProtocolError};

/// The only protocol version this server speaks.
pub const SUPPORTED_VERSION: &str = "1";

/// Reasons carried by `error` frames.
pub mod reason {
    /// The payload could not be decoded.
    pub const INVALID_FORMAT: &str = "Invalid message format";
    /// The payload decoded but is not an object with a `msg` string.
    pub const INVALID_OBJECT: &str = "Invalid JSON object";
    /// `msg` names no known frame kind.
    pub const UNKNOWN_TYPE: &str = "Unknown msg type";
    /// A frame arrived before the handshake.
    pub const NOT_CONNECTED: &str = "Did not send 'connect' as the first message";
    /// A second `connect` arrived.
    pub const ALREADY_CONNECTED: &str =
        "Sent 'connect' when a connection has already been established";
    /// A cursor failed to produce its initial documents.
    pub const SNAPSHOT_FAILED: &str = "Unable to get initial cursor data";
}

/// Inbound frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Handshake request.
    Connect,
    /// Liveness probe from the client.
    Ping,
    /// Answer to a server ping.
    Pong,
    /// Remote procedure call.
    Method,
    /// Subscription request.
    Sub,
    /// Subscription teardown.
    Unsub,
}

impl MessageKind {
    /// Look up a kind by its `msg` value.
    pub fn parse(msg: &str) -> Option<Self> {
        Some(match msg {
            "connect" => Self::Connect,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "method" => Self::Method,
            "sub" => Self::Sub,
            "unsub" => Self::Unsub,
            _ => return None,
        })
    }

    /// The `msg` value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Method => "method",
            Self::Sub => "sub",
            Self::Unsub => "unsub",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope-level decode failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not decodable at all.
    #[error("Invalid message format")]
    InvalidFormat(#[source] Option<CodecError>),
    /// Decoded, but not an object carrying a `msg` string.
    #[error("Invalid JSON object")]
    NotAnObject(Value),
    /// `msg` is not a known kind.
    #[error("Unknown msg type")]
    UnknownType(Value),
}

impl FrameError {
    /// The decoded payload, when there is one to quote.
    pub fn offending_message(&self) -> Option<&Value> {
        match self {
            Self::InvalidFormat(_) => None,
            Self::NotAnObject(value) | Self::UnknownType(value) => Some(value),
        }
    }

    /// The `error` frame reporting this failure.
    pub fn into_message(self) -> ServerMessage {
        let reason = self.to_string();
        match self {
            Self::InvalidFormat(_) => ServerMessage::error(reason),
            Self::NotAnObject(value) | Self::UnknownType(value) => {
                ServerMessage::error_with(reason, value)
            }
        }
    }
}

/// A decoded inbound frame whose kind is known but whose fields are not yet
/// validated.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    kind: MessageKind,
    body: Fields,
}

/// Check the envelope of an inbound payload.
pub fn decode_frame(text: &str) -> Result<Frame, FrameError> {
    let value = ejson::parse(text).map_err(|e| FrameError::InvalidFormat(Some(e)))?;
    let body = match value {
        Value::Object(body) => body,
        falsy if is_falsy(&falsy) => return Err(FrameError::InvalidFormat(None)),
        other => return Err(FrameError::NotAnObject(other)),
    };
    let kind = match body.get("msg") {
        Some(Value::String(msg)) if !msg.is_empty() => MessageKind::parse(msg),
        _ => return Err(FrameError::NotAnObject(Value::Object(body))),
    };
    match kind {
        Some(kind) => Ok(Frame { kind, body }),
        None => Err(FrameError::UnknownType(Value::Object(body))),
    }
}

/// `null`, `false`, zero, NaN and `""` carry no frame at all.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) | Value::NonFinite(NonFinite::NaN) => true,
        Value::Number(_) => value
            .as_f64()
            .is_some_and(|n| n.classify() == FpCategory::Zero),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

impl Frame {
    /// Frame kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The whole frame as a value, for quoting in error replies.
    pub fn raw(&self) -> Value {
        Value::Object(self.body.clone())
    }

    /// Validate the fields for this kind.
    pub fn parse(&self) -> Result<ClientMessage, ProtocolError> {
        let body = &self.body;
        Ok(match self.kind {
            MessageKind::Connect => ClientMessage::Connect {
                version: optional_str(body, "version"),
                support: body
                    .get("support")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default(),
                session: optional_str(body, "session"),
            },
            MessageKind::Ping => ClientMessage::Ping {
                id: optional_str(body, "id"),
                fields: body
                    .iter()
                    .filter(|(k, _)| k.as_str() != "msg")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
            MessageKind::Pong => ClientMessage::Pong {
                id: optional_str(body, "id"),
            },
            MessageKind::Method => ClientMessage::Method(MethodCall {
                id: required_str(body, "id", ProtocolError::MissingId)?,
                method: required_str(body, "method", ProtocolError::MissingMethod)?,
                params: params(body)?,
                random_seed: body.get("randomSeed").cloned(),
            }),
            MessageKind::Sub => ClientMessage::Sub {
                id: required_str(body, "id", ProtocolError::MissingId)?,
                name: required_str(body, "name", ProtocolError::MissingName)?,
                params: params(body)?,
            },
            MessageKind::Unsub => ClientMessage::Unsub {
                id: required_str(body, "id", ProtocolError::MissingId)?,
            },
        })
    }
}

fn required_str(body: &Fields, key: &str, missing: ProtocolError) -> Result<String, ProtocolError> {
    match body.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(missing),
    }
}

fn optional_str(body: &Fields, key: &str) -> Option<String> {
    body.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn params(body: &Fields) -> Result<Vec<Value>, ProtocolError> {
    match body.get("params") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(ProtocolError::InvalidParams),
    }
}

/// A validated `method` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    /// Client-chosen call id.
    pub id: String,
    /// Registered method name.
    pub method: String,
    /// Positional arguments.
    pub params: Vec<Value>,
    /// Client seed for id generation; accepted and ignored.
    pub random_seed: Option<Value>,
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Handshake request.
    Connect {
        /// Requested version.
        version: Option<String>,
        /// Versions the client can fall back to.
        support: Vec<String>,
        /// Previous session to resume; not supported.
        session: Option<String>,
    },
    /// Client liveness probe; answered with a pong echoing `fields`.
    Ping {
        /// Optional probe id.
        id: Option<String>,
        /// Every field of the frame except `msg`.
        fields: Fields,
    },
    /// Answer to a server ping.
    Pong {
        /// Id of the ping being answered.
        id: Option<String>,
    },
    /// Remote procedure call.
    Method(MethodCall),
    /// Subscription request.
    Sub {
        /// Client-chosen subscription id.
        id: String,
        /// Publication name.
        name: String,
        /// Positional publication arguments.
        params: Vec<Value>,
    },
    /// Subscription teardown.
    Unsub {
        /// Subscription id.
        id: String,
    },
}

/// Outbound frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Handshake accepted.
    Connected {
        /// Fresh session id.
        session: String,
    },
    /// Handshake refused; carries the version the server wants.
    Failed {
        /// Supported version.
        version: String,
    },
    /// Server liveness probe.
    Ping {
        /// Id the client must echo in its pong.
        id: String,
    },
    /// Answer to a client ping, echoing its fields.
    Pong {
        /// Echoed fields.
        fields: Fields,
    },
    /// Outcome of a method call.
    Result {
        /// Call id.
        id: String,
        /// Return value or error body.
        outcome: Result<Value, MethodErrorBody>,
    },
    /// Writes of the listed calls are reflected in the data sent so far.
    Updated {
        /// Call ids.
        methods: Vec<String>,
    },
    /// Initial data of the listed subscriptions has been sent.
    Ready {
        /// Subscription ids.
        subs: Vec<String>,
    },
    /// Document added to a collection.
    Added {
        /// Collection (cursor) name.
        collection: String,
        /// Document id.
        id: String,
        /// Document fields.
        fields: Fields,
    },
    /// Document changed.
    Changed {
        /// Collection (cursor) name.
        collection: String,
        /// Document id.
        id: String,
        /// Fields set to new values.
        fields: Fields,
        /// Fields removed.
        cleared: Vec<String>,
    },
    /// Document removed.
    Removed {
        /// Collection (cursor) name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// Protocol-level error.
    Error {
        /// Human-readable reason.
        reason: String,
        /// The inbound frame that caused it.
        offending_message: Option<Value>,
    },
}

impl ServerMessage {
    /// `connected` frame.
    pub fn connected(session: impl Into<String>) -> Self {
        Self::Connected {
            session: session.into(),
        }
    }

    /// `failed` frame naming the supported version.
    pub fn failed() -> Self {
        Self::Failed {
            version: SUPPORTED_VERSION.to_owned(),
        }
    }

    /// Server `ping` frame.
    pub fn ping(id: impl Into<String>) -> Self {
        Self::Ping { id: id.into() }
    }

    /// Successful `result` frame.
    pub fn result_ok(id: impl Into<String>, value: Value) -> Self {
        Self::Result {
            id: id.into(),
            outcome: Ok(value),
        }
    }

    /// Failed `result` frame.
    pub fn result_err(id: impl Into<String>, err: &MethodError) -> Self {
        Self::Result {
            id: id.into(),
            outcome: Err(err.to_body()),
        }
    }

    /// `updated` frame for a single call.
    pub fn updated(id: impl Into<String>) -> Self {
        Self::Updated {
            methods: vec![id.into()],
        }
    }

    /// `ready` frame for a single subscription.
    pub fn ready(id: impl Into<String>) -> Self {
        Self::Ready {
            subs: vec![id.into()],
        }
    }

    /// `error` frame without an offending message.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
            offending_message: None,
        }
    }

    /// `error` frame quoting the inbound frame.
    pub fn error_with(reason: impl Into<String>, offending: Value) -> Self {
        Self::Error {
            reason: reason.into(),
            offending_message: Some(offending),
        }
    }

    /// The `msg` discriminator.
    pub fn msg(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Result { .. } => "result",
            Self::Updated { .. } => "updated",
            Self::Ready { .. } => "ready",
            Self::Added { .. } => "added",
            Self::Changed { .. } => "changed",
            Self::Removed { .. } => "removed",
            Self::Error { .. } => "error",
        }
    }

    /// The frame as an EJSON object.
    pub fn to_value(&self) -> Value {
        let mut out = Fields::new();
        let mut put = |key: &str, value: Value| {
            let _ = out.insert(key.to_owned(), value);
        };
        match self {
            Self::Connected { session } => put("session", session.as_str().into()),
            Self::Failed { version } => put("version", version.as_str().into()),
            Self::Ping { id } => put("id", id.as_str().into()),
            Self::Pong { fields } => {
                for (k, v) in fields {
                    put(k, v.clone());
                }
            }
            Self::Result { id, outcome } => {
                put("id", id.as_str().into());
                match outcome {
                    Ok(value) => put("result", value.clone()),
                    Err(body) => put("error", error_body(body)),
                }
            }
            Self::Updated { methods } => put("methods", strings(methods)),
            Self::Ready { subs } => put("subs", strings(subs)),
            Self::Added {
                collection,
                id,
                fields,
            } => {
                put("collection", collection.as_str().into());
                put("id", id.as_str().into());
                put("fields", Value::Object(fields.clone()));
            }
            Self::Changed {
                collection,
                id,
                fields,
                cleared,
            } => {
                put("collection", collection.as_str().into());
                put("id", id.as_str().into());
                put("fields", Value::Object(fields.clone()));
                put("cleared", strings(cleared));
            }
            Self::Removed { collection, id } => {
                put("collection", collection.as_str().into());
                put("id", id.as_str().into());
            }
            Self::Error {
                reason,
                offending_message,
            } => {
                put("reason", reason.as_str().into());
                if let Some(offending) = offending_message {
                    put("offendingMessage", offending.clone());
                }
            }
        }
        let _ = out.insert("msg".to_owned(), self.msg().into());
        Value::Object(out)
    }

    /// Encode as EJSON text.
    pub fn encode(&self) -> Result<String, CodecError> {
        ejson::stringify(self)
    }
}

fn strings(items: &[String]) -> Value {
    Value::Array(items.iter().map(|s| s.as_str().into()).collect())
}

fn error_body(body: &MethodErrorBody) -> Value {
    [
        ("error".to_owned(), Value::from(body.error.as_str())),
        ("message".to_owned(), Value::from(body.message.as_str())),
    ]
    .into_iter()
    .collect()
}

impl Serialize for ServerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}
