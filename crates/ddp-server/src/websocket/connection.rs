//! Per-socket connection state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ddp_core::{ConnectionId, ServerMessage};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::FRAMES_DROPPED_TOTAL;

/// Handshake state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for `connect`.
    Init,
    /// Handshake completed.
    Established {
        /// Session id sent in `connected`.
        session: String,
    },
    /// Closed; nothing more is sent.
    Closed,
}

/// A connected client, shared by the dispatcher, heartbeat and cursor
/// drivers.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    state: Mutex<ConnectionState>,
    /// Ids of server pings not yet answered, oldest first.
    pending_pings: Mutex<VecDeque<String>>,
    /// Send channel to the socket writer task.
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    connected_at: Instant,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection in the `Init` state.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState::Init),
            pending_pings: Mutex::new(VecDeque::new()),
            tx,
            cancel,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Whether the handshake has completed and the connection is open.
    pub fn is_established(&self) -> bool {
        matches!(*self.state.lock(), ConnectionState::Established { .. })
    }

    /// Move from `Init` to `Established`. Returns `false` in any other state.
    pub fn establish(&self, session: String) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Init || self.cancel.is_cancelled() {
            return false;
        }
        *state = ConnectionState::Established { session };
        true
    }

    /// Close the connection. Idempotent.
    ///
    /// Cancels the connection token, which stops the heartbeat, the cursor
    /// drivers and the socket writer.
    pub fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
        if !self.cancel.is_cancelled() {
            debug!(conn_id = %self.id, "closing connection");
            self.cancel.cancel();
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Token cancelled when this connection closes.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Remember an outstanding server ping.
    pub fn record_ping(&self, id: String) {
        self.pending_pings.lock().push_back(id);
    }

    /// Forget an answered ping. Returns `false` for unknown ids.
    pub fn acknowledge_ping(&self, id: &str) -> bool {
        let mut pings = self.pending_pings.lock();
        match pings.iter().position(|p| p == id) {
            Some(index) => pings.remove(index).is_some(),
            None => false,
        }
    }

    /// Number of outstanding pings.
    pub fn unanswered_pings(&self) -> usize {
        self.pending_pings.lock().len()
    }

    /// Queue a frame for the client.
    ///
    /// Waits while the queue is full. Returns `false` if the connection is
    /// closed or closes meanwhile; a dead writer closes the connection.
    pub async fn send(&self, message: &ServerMessage) -> bool {
        if self.is_closed() {
            self.record_drop();
            return false;
        }
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(conn_id = %self.id, msg = message.msg(), error = %err, "failed to encode frame");
                return false;
            }
        };
        tokio::select! {
            biased;
            sent = self.tx.send(text) => {
                if sent.is_err() {
                    warn!(conn_id = %self.id, "socket writer gone, closing connection");
                    self.record_drop();
                    self.close();
                    return false;
                }
                true
            }
            () = self.cancel.cancelled() => {
                self.record_drop();
                false
            }
        }
    }

    fn record_drop(&self) {
        let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        counter!(FRAMES_DROPPED_TOTAL).increment(1);
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
