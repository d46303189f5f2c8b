//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use ddp_core::ServerMessage;
use ddp_core::ids::new_ping_id;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::Connection;
use crate::metrics::HEARTBEAT_EVICTIONS_TOTAL;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Too many pings went unanswered.
    Evicted,
    /// The heartbeat was cancelled externally.
    Cancelled,
    /// A ping could not be queued because the connection is gone.
    TransportClosed,
}

/// Run heartbeat pings for a connection.
///
/// Every `interval` (first tick one interval after start): if at least
/// `max_unanswered` pings are outstanding the loop returns
/// [`HeartbeatResult::Evicted`]; otherwise a new ping is recorded and sent.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    max_unanswered: usize,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
            _ = ticker.tick() => {
                let outstanding = connection.unanswered_pings();
                if outstanding >= max_unanswered {
                    return HeartbeatResult::Evicted;
                }
                let id = new_ping_id();
                connection.record_ping(id.clone());
                if !connection.send(&ServerMessage::ping(id)).await {
                    return HeartbeatResult::TransportClosed;
                }
            }
        }
    }
}

/// Spawn the heartbeat for an established connection.
///
/// Eviction closes the connection. The task stops when `cancel` fires or the
/// connection closes.
pub fn spawn_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    max_unanswered: usize,
    cancel: CancellationToken,
) -> JoinHandle<HeartbeatResult> {
    tokio::spawn(async move {
        let result = run_heartbeat(Arc::clone(&connection), interval, max_unanswered, cancel).await;
        match result {
            HeartbeatResult::Evicted => {
                warn!(
                    conn_id = %connection.id,
                    unanswered = connection.unanswered_pings(),
                    "client stopped answering pings, disconnecting"
                );
                counter!(HEARTBEAT_EVICTIONS_TOTAL).increment(1);
                connection.close();
            }
            HeartbeatResult::Cancelled | HeartbeatResult::TransportClosed => {
                debug!(conn_id = %connection.id, ?result, "heartbeat stopped");
            }
        }
        result
    })
}
