//! Subscriptions: one driver task per cursor, merged onto the connection.
//!
//! A driver attaches to its cursor's event stream, sends the snapshot as
//! `added` frames followed by `ready`, then forwards live events until the
//! subscription is cancelled. On the way out it drops the stream and closes
//! the cursor exactly once.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ddp_core::protocol::reason;
use ddp_core::{Cursor, CursorError, CursorEventStream, Cursors, ServerMessage};
use futures::{FutureExt, StreamExt};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::metrics::{SUBSCRIPTIONS_ACTIVE, SUBSCRIPTIONS_TOTAL};
use crate::rpc::invoker::panic_message;
use crate::websocket::connection::Connection;

/// A live subscription owned by one connection.
pub struct Subscription {
    id: String,
    publication: String,
    token: CancellationToken,
    drivers: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Spawn a driver per cursor.
    ///
    /// Each cursor yields exactly one `ready`; a publication with no
    /// cursors yields none.
    pub fn start(
        id: String,
        publication: String,
        cursors: Cursors,
        connection: &Arc<Connection>,
    ) -> Self {
        let token = connection.child_token();
        counter!(SUBSCRIPTIONS_TOTAL, "publication" => publication.clone()).increment(1);
        gauge!(SUBSCRIPTIONS_ACTIVE).increment(1.0);
        debug!(
            conn_id = %connection.id,
            sub_id = %id,
            publication = %publication,
            cursors = cursors.len(),
            "subscription started"
        );

        let drivers = cursors
            .into_iter()
            .map(|cursor| {
                tokio::spawn(drive_cursor(
                    id.clone(),
                    cursor,
                    Arc::clone(connection),
                    token.clone(),
                ))
            })
            .collect();

        Self {
            id,
            publication,
            token,
            drivers,
        }
    }

    /// Subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publication name.
    pub fn publication(&self) -> &str {
        &self.publication
    }

    /// Cancel every driver and wait for them to close their cursors.
    pub async fn stop(self) {
        self.token.cancel();
        for driver in self.drivers {
            if let Err(err) = driver.await {
                warn!(sub_id = %self.id, error = %err, "cursor driver failed");
            }
        }
        gauge!(SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        debug!(sub_id = %self.id, publication = %self.publication, "subscription stopped");
    }
}

async fn drive_cursor(
    sub_id: String,
    mut cursor: Box<dyn Cursor>,
    connection: Arc<Connection>,
    cancel: CancellationToken,
) {
    let collection = cursor.name().to_owned();
    let mut events = match std::panic::catch_unwind(AssertUnwindSafe(|| cursor.events())) {
        Ok(events) => Some(events),
        Err(panic) => {
            error!(sub_id = %sub_id, collection = %collection, panic = %panic_message(&*panic), "cursor events panicked");
            None
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = publish_cursor(&sub_id, &collection, cursor.as_mut(), events.as_mut(), &connection) => {}
    }

    drop(events);
    if let Err(err) = cursor.close().await {
        warn!(sub_id = %sub_id, collection = %collection, error = %err, "failed to close cursor");
    }
}

async fn publish_cursor(
    sub_id: &str,
    collection: &str,
    cursor: &mut dyn Cursor,
    events: Option<&mut CursorEventStream>,
    connection: &Connection,
) {
    let snapshot = match events {
        Some(_) => match AssertUnwindSafe(cursor.snapshot()).catch_unwind().await {
            Ok(snapshot) => snapshot,
            Err(panic) => Err(CursorError::Backend(format!(
                "snapshot panicked: {}",
                panic_message(&*panic)
            ))),
        },
        None => Err(CursorError::Backend("event stream unavailable".into())),
    };

    match snapshot {
        Ok(documents) => {
            for document in documents {
                let added = ServerMessage::Added {
                    collection: collection.to_owned(),
                    id: document.id,
                    fields: document.fields,
                };
                if !connection.send(&added).await {
                    return;
                }
            }
        }
        Err(err) => {
            warn!(sub_id, collection, error = %err, "cursor snapshot failed");
            if !connection.send(&ServerMessage::error(reason::SNAPSHOT_FAILED)).await {
                return;
            }
        }
    }

    if !connection.send(&ServerMessage::ready(sub_id)).await {
        return;
    }

    let Some(events) = events else { return };
    let live = AssertUnwindSafe(async {
        while let Some(event) = events.next().await {
            if !connection.send(&event.into_message(collection)).await {
                return;
            }
        }
        debug!(sub_id, collection, "cursor event stream ended");
    })
    .catch_unwind()
    .await;
    if let Err(panic) = live {
        error!(sub_id, collection, panic = %panic_message(&*panic), "cursor event stream panicked");
    }
}

/// The subscriptions of one connection, by id.
#[derive(Default)]
pub struct SubscriptionSet {
    subs: HashMap<String, Subscription>,
}

impl SubscriptionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &str) -> bool {
        self.subs.contains_key(id)
    }

    /// Track a started subscription.
    pub fn insert(&mut self, subscription: Subscription) {
        let _ = self
            .subs
            .insert(subscription.id().to_owned(), subscription);
    }

    /// Stop and forget `id`. Returns `false` if it was not live.
    pub async fn remove(&mut self, id: &str) -> bool {
        match self.subs.remove(id) {
            Some(subscription) => {
                subscription.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every subscription.
    pub async fn close_all(&mut self) {
        let subs: Vec<Subscription> = self.subs.drain().map(|(_, sub)| sub).collect();
        let _ = futures::future::join_all(subs.into_iter().map(Subscription::stop)).await;
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Whether there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ddp_core::{ConnectionId, Fields, Snapshot, Value};
    use ddp_storage::{MemoryStore, Store};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn setup() -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(Connection::new(
            ConnectionId::new(),
            tx,
            CancellationToken::new(),
        ));
        (conn, rx)
    }

    fn fields(raw: serde_json::Value) -> Fields {
        Value::from_json(raw).unwrap().into_object().unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    struct Broken {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Cursor for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn events(&mut self) -> CursorEventStream {
            futures::stream::pending().boxed()
        }

        async fn snapshot(&mut self) -> Result<Snapshot, CursorError> {
            Err(CursorError::Backend("offline".into()))
        }

        async fn close(&mut self) -> Result<(), CursorError> {
            let _ = self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn snapshot_then_ready_then_live() {
        let (conn, mut rx) = setup();
        let store = MemoryStore::new("items");
        assert!(store.add("a", fields(json!({"n": 1}))).await.unwrap());

        let sub = Subscription::start("s1".into(), "items".into(), store.cursor().into(), &conn);
        assert_eq!(
            next(&mut rx).await,
            json!({"msg": "added", "collection": "items", "id": "a", "fields": {"n": 1}})
        );
        assert_eq!(next(&mut rx).await, json!({"msg": "ready", "subs": ["s1"]}));

        assert!(store.set("a", fields(json!({"m": 2}))).await.unwrap());
        assert_eq!(
            next(&mut rx).await,
            json!({"msg": "changed", "collection": "items", "id": "a", "fields": {"m": 2}, "cleared": ["n"]})
        );

        assert!(store.remove("a").await.unwrap());
        assert_eq!(
            next(&mut rx).await,
            json!({"msg": "removed", "collection": "items", "id": "a"})
        );

        sub.stop().await;
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn one_ready_per_cursor() {
        let (conn, mut rx) = setup();
        let a = MemoryStore::new("a");
        let b = MemoryStore::new("b");
        let cursors: Cursors = vec![
            Box::new(a.cursor()) as Box<dyn Cursor>,
            Box::new(b.cursor()),
        ]
        .into();
        let sub = Subscription::start("multi".into(), "both".into(), cursors, &conn);
        assert_eq!(next(&mut rx).await["msg"], "ready");
        assert_eq!(next(&mut rx).await["msg"], "ready");
        sub.stop().await;
    }

    #[tokio::test]
    async fn no_cursors_no_ready() {
        let (conn, mut rx) = setup();
        let sub = Subscription::start("none".into(), "empty".into(), Cursors::new(), &conn);
        sub.stop().await;
        assert!(rx.try_recv().is_err());
    }

    /// Cursor that panics while attaching or while snapshotting.
    struct Panicking {
        in_events: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Cursor for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn events(&mut self) -> CursorEventStream {
            if self.in_events {
                panic!("events exploded");
            }
            futures::stream::pending().boxed()
        }

        async fn snapshot(&mut self) -> Result<Snapshot, CursorError> {
            panic!("snapshot exploded");
        }

        async fn close(&mut self) -> Result<(), CursorError> {
            let _ = self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn cursor_panics_report_error_then_ready_and_close() {
        for in_events in [false, true] {
            let (conn, mut rx) = setup();
            let closes = Arc::new(AtomicUsize::new(0));
            let cursor = Panicking {
                in_events,
                closes: Arc::clone(&closes),
            };
            let sub = Subscription::start("p".into(), "panicking".into(), cursor.into(), &conn);
            assert_eq!(
                next(&mut rx).await,
                json!({"msg": "error", "reason": "Unable to get initial cursor data"})
            );
            assert_eq!(next(&mut rx).await, json!({"msg": "ready", "subs": ["p"]}));
            sub.stop().await;
            assert_eq!(closes.load(Ordering::SeqCst), 1);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn snapshot_failure_reports_error_then_ready() {
        let (conn, mut rx) = setup();
        let closes = Arc::new(AtomicUsize::new(0));
        let cursor = Broken {
            closes: Arc::clone(&closes),
        };
        let sub = Subscription::start("s".into(), "broken".into(), cursor.into(), &conn);
        assert_eq!(
            next(&mut rx).await,
            json!({"msg": "error", "reason": "Unable to get initial cursor data"})
        );
        assert_eq!(next(&mut rx).await["msg"], "ready");
        sub.stop().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_close_stops_drivers() {
        let (conn, mut rx) = setup();
        let closes = Arc::new(AtomicUsize::new(0));
        let cursor = Broken {
            closes: Arc::clone(&closes),
        };
        let mut set = SubscriptionSet::new();
        set.insert(Subscription::start("s".into(), "broken".into(), cursor.into(), &conn));
        let _ = next(&mut rx).await;
        let _ = next(&mut rx).await;

        conn.close();
        set.close_all().await;
        assert!(set.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn set_remove_is_idempotent() {
        let (conn, mut rx) = setup();
        let store = MemoryStore::new("items");
        let mut set = SubscriptionSet::new();
        set.insert(Subscription::start("s".into(), "items".into(), store.cursor().into(), &conn));
        assert!(set.contains("s"));
        assert_eq!(next(&mut rx).await["msg"], "ready");

        assert!(set.remove("s").await);
        assert!(!set.remove("s").await);
        assert_eq!(set.len(), 0);

        assert!(store.add("late", Fields::new()).await.unwrap());
        assert!(rx.try_recv().is_err());
    }
}
