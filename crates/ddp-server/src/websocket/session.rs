//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use ddp_core::ConnectionId;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::Connection;
use super::dispatcher::{Dispatcher, Flow};
use super::tracker::ConnectionTracker;
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::rpc::registry::Registry;
use crate::shutdown::ShutdownCoordinator;

/// How long the writer gets to flush queued frames after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state a session needs.
#[derive(Clone)]
pub struct SessionContext {
    /// Methods and publications.
    pub registry: Arc<Registry>,
    /// Server settings.
    pub config: Arc<ServerConfig>,
    /// Open connections.
    pub tracker: Arc<ConnectionTracker>,
    /// Server-wide cancellation.
    pub shutdown: ShutdownCoordinator,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Spawns the writer, which drains the send queue into the socket
/// 2. Feeds inbound text (and UTF-8 binary) frames to the [`Dispatcher`]
/// 3. Stops on client close, transport error, eviction or server shutdown
/// 4. Tears down subscriptions and pending calls, flushes, sends a close frame
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_ws_session(ws: WebSocket, conn_id: ConnectionId, ctx: SessionContext) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<String>(ctx.config.send_queue_capacity.max(1));
    let connection = Arc::new(Connection::new(
        conn_id.clone(),
        send_tx,
        ctx.shutdown.child_token(),
    ));

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    ctx.tracker.add(Arc::clone(&connection)).await;

    let writer_conn = Arc::clone(&connection);
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        warn!(conn_id = %writer_conn.id, "socket write failed, closing connection");
                        writer_conn.close();
                        return;
                    }
                }
                () = writer_conn.closed() => break,
            }
        }
        while let Ok(text) = send_rx.try_recv() {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        let _ = ws_tx.close().await;
    });

    let mut dispatcher = Dispatcher::new(
        Arc::clone(&connection),
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.config),
    );

    let reason = loop {
        let incoming = tokio::select! {
            () = connection.closed() => {
                break if ctx.shutdown.is_shutting_down() { "server_shutdown" } else { "connection_closed" };
            }
            incoming = ws_rx.next() => incoming,
        };

        let text = match incoming {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) => {
                info!("client sent close frame");
                break "client_closed";
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Err(err)) => {
                warn!(error = %err, "websocket read failed");
                break "transport_error";
            }
            None => break "client_closed",
        };

        if dispatcher.handle_text(&text).await == Flow::Close {
            break "handshake_failed";
        }
    };

    dispatcher.shutdown().await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!("writer did not drain in time, aborting");
        writer.abort();
    }

    info!(reason, dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    ctx.tracker.remove(&conn_id).await;
}
