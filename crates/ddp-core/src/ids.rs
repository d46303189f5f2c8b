//! Identifier generation.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-side id of a socket connection, used in logs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl ConnectionId {
    /// Fresh, time-ordered id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session id handed out in `connected`.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Id for a server-initiated ping.
pub fn new_ping_id() -> String {
    Uuid::new_v4().to_string()
}
