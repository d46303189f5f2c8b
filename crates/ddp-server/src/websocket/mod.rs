//! WebSocket connection management, heartbeat, frame dispatch and session
//! lifecycle.

pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod session;
pub mod tracker;
