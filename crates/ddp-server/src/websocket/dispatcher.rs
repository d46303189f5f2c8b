//! Inbound frame dispatch for one connection.
//!
//! Frames are decoded, checked against the handshake state and routed to
//! the heartbeat, the method invoker or the subscription set. Every failure
//! short of a version mismatch is answered with an `error` frame and the
//! connection stays open.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ddp_core::ids::new_session_id;
use ddp_core::protocol::{SUPPORTED_VERSION, decode_frame, reason};
use ddp_core::{ClientMessage, ConnectionId, Fields, MessageKind, ProtocolError, ServerMessage, Value};
use metrics::counter;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionState};
use super::heartbeat::{HeartbeatResult, spawn_heartbeat};
use crate::config::ServerConfig;
use crate::metrics::{FRAMES_RECEIVED_TOTAL, PROTOCOL_ERRORS_TOTAL};
use crate::rpc::invoker::MethodInvoker;
use crate::rpc::registry::Registry;
use crate::subscription::{Subscription, SubscriptionSet};

/// What the session loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Stop reading and close the socket.
    Close,
}

/// Per-connection frame handler. Owns the connection's subscriptions,
/// pending method calls and heartbeat.
pub struct Dispatcher {
    connection: Arc<Connection>,
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    invoker: MethodInvoker,
    subscriptions: SubscriptionSet,
    pending: JoinSet<()>,
    heartbeat: Option<JoinHandle<HeartbeatResult>>,
}

impl Dispatcher {
    /// Create a dispatcher for a fresh connection.
    pub fn new(connection: Arc<Connection>, registry: Arc<Registry>, config: Arc<ServerConfig>) -> Self {
        let invoker = MethodInvoker::new(Arc::clone(&registry), config.method_timeout());
        Self {
            connection,
            registry,
            config,
            invoker,
            subscriptions: SubscriptionSet::new(),
            pending: JoinSet::new(),
            heartbeat: None,
        }
    }

    /// The connection being served.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of method calls still awaiting a result.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Handle one inbound text payload.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        self.reap_pending();
        if self.connection.is_closed() {
            return Flow::Close;
        }

        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn_id = %self.conn_id(), error = %err, "rejected frame");
                counter!(PROTOCOL_ERRORS_TOTAL, "reason" => err.to_string()).increment(1);
                let _ = self.connection.send(&err.into_message()).await;
                return Flow::Continue;
            }
        };
        let kind = frame.kind();
        counter!(FRAMES_RECEIVED_TOTAL, "msg" => kind.as_str()).increment(1);

        if let Some(reason) = self.sequence_error(kind) {
            self.reject(reason, frame.raw()).await;
            return Flow::Continue;
        }

        let message = match frame.parse() {
            Ok(message) => message,
            Err(err) => {
                self.reject(&format!("[{kind}]: {err}"), frame.raw()).await;
                return Flow::Continue;
            }
        };
        debug!(conn_id = %self.conn_id(), msg = %kind, "dispatching frame");

        match message {
            ClientMessage::Connect {
                version,
                support,
                session,
            } => return self.handle_connect(version, &support, session).await,
            ClientMessage::Ping { fields, .. } => self.handle_ping(fields).await,
            ClientMessage::Pong { id } => self.handle_pong(id),
            ClientMessage::Method(call) => {
                self.invoker
                    .invoke(call, &self.connection, &mut self.pending)
                    .await;
            }
            ClientMessage::Sub { id, name, params } => {
                if let Err(err) = self.handle_sub(id, name, params) {
                    self.reject(&format!("[{kind}]: {err}"), frame.raw()).await;
                }
            }
            ClientMessage::Unsub { id } => {
                if !self.subscriptions.remove(&id).await {
                    debug!(conn_id = %self.conn_id(), sub_id = %id, "unsub for unknown subscription");
                }
            }
        }
        Flow::Continue
    }

    fn conn_id(&self) -> &ConnectionId {
        &self.connection.id
    }

    fn sequence_error(&self, kind: MessageKind) -> Option<&'static str> {
        match (self.connection.state(), kind) {
            (ConnectionState::Init, MessageKind::Connect) => None,
            (ConnectionState::Init, _) => Some(reason::NOT_CONNECTED),
            (ConnectionState::Established { .. }, MessageKind::Connect) => {
                Some(reason::ALREADY_CONNECTED)
            }
            (ConnectionState::Established { .. } | ConnectionState::Closed, _) => None,
        }
    }

    async fn reject(&self, reason: &str, offending: Value) {
        warn!(conn_id = %self.conn_id(), reason, "protocol error");
        counter!(PROTOCOL_ERRORS_TOTAL, "reason" => reason.to_owned()).increment(1);
        let _ = self
            .connection
            .send(&ServerMessage::error_with(reason, offending))
            .await;
    }

    async fn handle_connect(
        &mut self,
        version: Option<String>,
        support: &[String],
        session: Option<String>,
    ) -> Flow {
        if let Some(session) = session {
            warn!(conn_id = %self.conn_id(), session = %session, "session resume is not supported, starting a new session");
        }
        if version.as_deref() != Some(SUPPORTED_VERSION) {
            info!(
                conn_id = %self.conn_id(),
                requested = ?version,
                ?support,
                "unsupported protocol version, refusing handshake"
            );
            let _ = self.connection.send(&ServerMessage::failed()).await;
            return Flow::Close;
        }

        let session = new_session_id();
        if !self.connection.establish(session.clone()) {
            return Flow::Close;
        }
        info!(conn_id = %self.conn_id(), session = %session, "handshake complete");
        let _ = self.connection.send(&ServerMessage::connected(session)).await;

        self.heartbeat = Some(spawn_heartbeat(
            Arc::clone(&self.connection),
            self.config.heartbeat_interval(),
            self.config.max_unanswered_pings,
            self.connection.child_token(),
        ));
        Flow::Continue
    }

    async fn handle_ping(&self, fields: Fields) {
        let _ = self.connection.send(&ServerMessage::Pong { fields }).await;
    }

    fn handle_pong(&self, id: Option<String>) {
        let acknowledged = id
            .as_deref()
            .is_some_and(|id| self.connection.acknowledge_ping(id));
        if !acknowledged {
            debug!(conn_id = %self.conn_id(), ?id, "pong for unknown ping");
        }
    }

    fn handle_sub(&mut self, id: String, name: String, params: Vec<Value>) -> Result<(), ProtocolError> {
        if self.subscriptions.contains(&id) {
            return Err(ProtocolError::DuplicateSubscription(id));
        }
        let publication = self
            .registry
            .publication(&name)
            .ok_or_else(|| ProtocolError::UnknownPublication(name.clone()))?;

        let cursors = match std::panic::catch_unwind(AssertUnwindSafe(|| publication.publish(params))) {
            Ok(Ok(cursors)) => cursors,
            Ok(Err(err)) => {
                warn!(conn_id = %self.conn_id(), publication = %name, error = %err, "publication failed");
                return Err(ProtocolError::PublicationFailed(err.message));
            }
            Err(_) => {
                error!(conn_id = %self.conn_id(), publication = %name, "publication panicked");
                return Err(ProtocolError::PublicationPanicked(name));
            }
        };

        self.subscriptions
            .insert(Subscription::start(id, name, cursors, &self.connection));
        Ok(())
    }

    fn reap_pending(&mut self) {
        while let Some(joined) = self.pending.try_join_next() {
            match joined {
                Err(err) if err.is_panic() => {
                    error!(conn_id = %self.conn_id(), error = %err, "method task panicked");
                }
                _ => {}
            }
        }
    }

    /// Tear down everything the connection owns.
    ///
    /// Closes the connection, stops the heartbeat, closes every
    /// subscription's cursors and aborts pending method calls.
    pub async fn shutdown(mut self) {
        self.connection.close();
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.await;
        }
        self.subscriptions.close_all().await;
        self.pending.shutdown().await;
        debug!(conn_id = %self.conn_id(), "dispatcher shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::{async_method, publication, sync_method};
    use ddp_core::{Cursors, MethodError};
    use ddp_storage::{MemoryStore, Store};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        dispatcher: Dispatcher,
        rx: mpsc::Receiver<String>,
        store: MemoryStore,
    }

    impl Harness {
        fn new() -> Self {
            let store = MemoryStore::new("items");
            let mut registry = Registry::new();
            registry
                .register_method("echo", sync_method(|params| Ok(Value::Array(params))))
                .unwrap();
            registry
                .register_method(
                    "wait",
                    async_method(|_| futures::future::pending::<Result<Value, MethodError>>()),
                )
                .unwrap();
            let source = store.clone();
            registry
                .register_publication("items", publication(move |_| Ok(source.cursor().into())))
                .unwrap();
            registry
                .register_publication("nothing", publication(|_| Ok(Cursors::new())))
                .unwrap();
            registry
                .register_publication(
                    "denied",
                    publication(|_| Err(MethodError::new("not allowed"))),
                )
                .unwrap();
            registry
                .register_publication(
                    "explodes",
                    publication(|_| -> Result<Cursors, MethodError> { panic!("publish blew up") }),
                )
                .unwrap();

            let (tx, rx) = mpsc::channel(64);
            let conn = Arc::new(Connection::new(
                ConnectionId::new(),
                tx,
                CancellationToken::new(),
            ));
            let dispatcher = Dispatcher::new(conn, Arc::new(registry), Arc::new(ServerConfig::default()));
            Self {
                dispatcher,
                rx,
                store,
            }
        }

        async fn send(&mut self, frame: serde_json::Value) -> Flow {
            self.dispatcher.handle_text(&frame.to_string()).await
        }

        async fn next(&mut self) -> serde_json::Value {
            serde_json::from_str(&self.rx.recv().await.unwrap()).unwrap()
        }

        async fn connect(&mut self) {
            assert_eq!(
                self.send(json!({"msg": "connect", "version": "1", "support": ["1"]}))
                    .await,
                Flow::Continue
            );
            let connected = self.next().await;
            assert_eq!(connected["msg"], "connected");
            assert!(connected["session"].is_string());
        }
    }

    #[tokio::test]
    async fn handshake_establishes_connection() {
        let mut h = Harness::new();
        h.connect().await;
        assert!(h.dispatcher.connection().is_established());
        h.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn wrong_version_fails_and_closes() {
        let mut h = Harness::new();
        let flow = h
            .send(json!({"msg": "connect", "version": "pre2", "support": ["pre2", "1"]}))
            .await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(h.next().await, json!({"msg": "failed", "version": "1"}));
        assert!(!h.dispatcher.connection().is_established());
    }

    #[tokio::test]
    async fn frames_before_connect_are_rejected() {
        let mut h = Harness::new();
        let frame = json!({"msg": "method", "id": "1", "method": "echo"});
        assert_eq!(h.send(frame.clone()).await, Flow::Continue);
        assert_eq!(
            h.next().await,
            json!({
                "msg": "error",
                "reason": "Did not send 'connect' as the first message",
                "offendingMessage": frame
            })
        );
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let mut h = Harness::new();
        h.connect().await;
        let _ = h.send(json!({"msg": "connect", "version": "1"})).await;
        let err = h.next().await;
        assert_eq!(
            err["reason"],
            "Sent 'connect' when a connection has already been established"
        );
        assert!(h.dispatcher.connection().is_established());
    }

    #[tokio::test]
    async fn malformed_payloads() {
        let mut h = Harness::new();
        let _ = h.dispatcher.handle_text("{not json").await;
        assert_eq!(
            h.next().await,
            json!({"msg": "error", "reason": "Invalid message format"})
        );

        let _ = h.send(json!([1, 2])).await;
        assert_eq!(
            h.next().await,
            json!({"msg": "error", "reason": "Invalid JSON object", "offendingMessage": [1, 2]})
        );

        let _ = h.send(json!({"msg": "wat"})).await;
        assert_eq!(
            h.next().await,
            json!({"msg": "error", "reason": "Unknown msg type", "offendingMessage": {"msg": "wat"}})
        );
    }

    #[tokio::test]
    async fn missing_method_id_is_protocol_error() {
        let mut h = Harness::new();
        h.connect().await;
        let _ = h.send(json!({"msg": "method", "method": "echo"})).await;
        assert_eq!(h.next().await["reason"], "[method]: ID is not specified");
    }

    #[tokio::test]
    async fn ping_echoes_fields() {
        let mut h = Harness::new();
        h.connect().await;
        let _ = h.send(json!({"msg": "ping", "id": "p1", "extra": 7})).await;
        assert_eq!(h.next().await, json!({"msg": "pong", "id": "p1", "extra": 7}));
    }

    #[tokio::test]
    async fn pong_acknowledges_ping() {
        let mut h = Harness::new();
        h.connect().await;
        h.dispatcher.connection().record_ping("srv1".into());
        let _ = h.send(json!({"msg": "pong", "id": "srv1"})).await;
        assert_eq!(h.dispatcher.connection().unanswered_pings(), 0);
    }

    #[tokio::test]
    async fn method_call_roundtrip() {
        let mut h = Harness::new();
        h.connect().await;
        let _ = h
            .send(json!({"msg": "method", "id": "m1", "method": "echo", "params": [1, "two"]}))
            .await;
        assert_eq!(
            h.next().await,
            json!({"msg": "result", "id": "m1", "result": [1, "two"]})
        );
        assert_eq!(h.next().await, json!({"msg": "updated", "methods": ["m1"]}));
    }

    #[tokio::test]
    async fn subscription_lifecycle() {
        let mut h = Harness::new();
        h.connect().await;
        let _ = h.send(json!({"msg": "sub", "id": "s1", "name": "items"})).await;
        assert_eq!(h.next().await, json!({"msg": "ready", "subs": ["s1"]}));
        assert_eq!(h.dispatcher.subscription_count(), 1);

        let doc: Fields = [("title".to_owned(), Value::from("hello"))].into_iter().collect();
        assert!(h.store.add("d1", doc).await.unwrap());
        assert_eq!(
            h.next().await,
            json!({"msg": "added", "collection": "items", "id": "d1", "fields": {"title": "hello"}})
        );

        let _ = h.send(json!({"msg": "unsub", "id": "s1"})).await;
        assert_eq!(h.dispatcher.subscription_count(), 0);
        assert_eq!(h.store.listener_count(), 0);

        let _ = h.send(json!({"msg": "unsub", "id": "s1"})).await;
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_subscription_id_is_rejected() {
        let mut h = Harness::new();
        h.connect().await;
        let _ = h.send(json!({"msg": "sub", "id": "s1", "name": "items"})).await;
        assert_eq!(h.next().await["msg"], "ready");
        let _ = h.send(json!({"msg": "sub", "id": "s1", "name": "nothing"})).await;
        assert_eq!(
            h.next().await["reason"],
            "[sub]: Subscription 's1' is already active"
        );
        assert_eq!(h.dispatcher.subscription_count(), 1);
    }

    #[tokio::test]
    async fn empty_publication_sends_no_frames() {
        let mut h = Harness::new();
        h.connect().await;
        let _ = h.send(json!({"msg": "sub", "id": "e", "name": "nothing"})).await;
        assert_eq!(h.dispatcher.subscription_count(), 1);
        let _ = h.send(json!({"msg": "unsub", "id": "e"})).await;
        assert_eq!(h.dispatcher.subscription_count(), 0);
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_publications_report_errors() {
        let mut h = Harness::new();
        h.connect().await;

        let _ = h.send(json!({"msg": "sub", "id": "a", "name": "missing"})).await;
        assert_eq!(
            h.next().await["reason"],
            "[sub]: No subscription found with the name 'missing'"
        );

        let _ = h.send(json!({"msg": "sub", "id": "b", "name": "denied"})).await;
        assert_eq!(h.next().await["reason"], "[sub]: not allowed");

        let _ = h.send(json!({"msg": "sub", "id": "c", "name": "explodes"})).await;
        assert_eq!(
            h.next().await["reason"],
            "[sub]: Publication 'explodes' panicked"
        );
        assert_eq!(h.dispatcher.subscription_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let mut h = Harness::new();
        h.connect().await;
        let _ = h.send(json!({"msg": "sub", "id": "s1", "name": "items"})).await;
        let _ = h.next().await;
        let _ = h.send(json!({"msg": "method", "id": "w", "method": "wait"})).await;
        assert_eq!(h.next().await["msg"], "updated");
        assert_eq!(h.dispatcher.pending_count(), 1);

        let conn = Arc::clone(h.dispatcher.connection());
        h.dispatcher.shutdown().await;
        assert!(conn.is_closed());
        assert_eq!(h.store.listener_count(), 0);
    }
}
