//! # ddp-core
//!
//! Shared vocabulary of the DDP server crates.
//!
//! - **EJSON**: [`Value`], a JSON tree that keeps dates, binary data and
//!   non-finite numbers, with its text codec
//! - **Frames**: inbound [`ClientMessage`] decoding and outbound
//!   [`ServerMessage`] encoding
//! - **Cursors**: the [`Cursor`] trait implemented by storage backends and
//!   the events it reports
//! - **Validation**: [`check`] against a structural [`Pattern`]
//! - **Errors**: `thiserror` enums for each layer

#![deny(unsafe_code)]

pub mod check;
pub mod cursor;
pub mod ejson;
pub mod errors;
pub mod ids;
pub mod protocol;

pub use check::{MatchError, Pattern, check, check_param};
pub use cursor::{Change, Cursor, CursorEvent, CursorEventStream, Cursors, Document, Snapshot};
pub use ejson::{Fields, NonFinite, Value};
pub use errors::{CodecError, CursorError, MethodError, MethodErrorBody, ProtocolError};
pub use ids::ConnectionId;
pub use protocol::{ClientMessage, Frame, FrameError, MessageKind, MethodCall, ServerMessage};
