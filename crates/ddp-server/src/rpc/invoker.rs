//! Method invocation and result delivery.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ddp_core::{MethodCall, MethodError, ServerMessage, Value};
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::registry::{MethodOutcome, Registry};
use crate::metrics::{METHOD_CALLS_TOTAL, METHOD_DURATION_SECONDS, METHOD_ERRORS_TOTAL};
use crate::websocket::connection::Connection;

/// Runs `method` calls against the registry.
///
/// Every call produces exactly one `result` and one `updated` frame. Ready
/// outcomes send `result` first; pending outcomes send `updated` at once and
/// deliver `result` from a task in the caller's [`JoinSet`].
#[derive(Clone)]
pub struct MethodInvoker {
    registry: Arc<Registry>,
    timeout: Duration,
}

impl MethodInvoker {
    /// Create an invoker with a time budget for pending results.
    pub fn new(registry: Arc<Registry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Handle one call.
    pub async fn invoke(
        &self,
        call: MethodCall,
        connection: &Arc<Connection>,
        pending: &mut JoinSet<()>,
    ) {
        let MethodCall {
            id,
            method: name,
            params,
            ..
        } = call;
        counter!(METHOD_CALLS_TOTAL, "method" => name.clone()).increment(1);
        let start = Instant::now();

        let Some(method) = self.registry.method(&name) else {
            debug!(conn_id = %connection.id, method = %name, "method not found");
            let result = Err(MethodError::not_found(&name));
            record_outcome(&name, &result, start);
            let _ = connection.send(&result_frame(&id, result)).await;
            let _ = connection.send(&ServerMessage::updated(id)).await;
            return;
        };

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| method.invoke(params))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    conn_id = %connection.id,
                    method = %name,
                    panic = %panic_message(&*panic),
                    "method panicked"
                );
                MethodOutcome::Ready(Err(MethodError::panicked(&name)))
            }
        };

        match outcome {
            MethodOutcome::Ready(result) => {
                record_outcome(&name, &result, start);
                let _ = connection.send(&result_frame(&id, result)).await;
                let _ = connection.send(&ServerMessage::updated(id)).await;
            }
            MethodOutcome::Pending(future) => {
                let _ = connection.send(&ServerMessage::updated(id.clone())).await;
                let connection = Arc::clone(connection);
                let timeout = self.timeout;
                let _ = pending.spawn(async move {
                    let settled =
                        tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await;
                    let result = match settled {
                        Ok(Ok(result)) => result,
                        Ok(Err(panic)) => {
                            error!(
                                conn_id = %connection.id,
                                method = %name,
                                panic = %panic_message(&*panic),
                                "method panicked"
                            );
                            Err(MethodError::panicked(&name))
                        }
                        Err(_) => {
                            warn!(
                                conn_id = %connection.id,
                                method = %name,
                                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                                "method timed out"
                            );
                            Err(MethodError::timed_out(&name))
                        }
                    };
                    record_outcome(&name, &result, start);
                    let _ = connection.send(&result_frame(&id, result)).await;
                });
            }
        }
    }
}

fn result_frame(id: &str, result: Result<Value, MethodError>) -> ServerMessage {
    match result {
        Ok(value) => ServerMessage::result_ok(id, value),
        Err(err) => ServerMessage::result_err(id, &err),
    }
}

fn record_outcome(name: &str, result: &Result<Value, MethodError>, start: Instant) {
    histogram!(METHOD_DURATION_SECONDS, "method" => name.to_owned())
        .record(start.elapsed().as_secs_f64());
    if let Err(err) = result {
        counter!(METHOD_ERRORS_TOTAL, "method" => name.to_owned(), "error_type" => err.kind.clone())
            .increment(1);
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::{async_method, sync_method};
    use ddp_core::ConnectionId;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn registry() -> Arc<Registry> {
        let mut reg = Registry::new();
        reg.register_method(
            "sum",
            sync_method(|params| {
                let total: i64 = params.iter().filter_map(Value::as_i64).sum();
                Ok(Value::from(total))
            }),
        )
        .unwrap();
        reg.register_method("fail", sync_method(|_| Err(MethodError::new("nope"))))
            .unwrap();
        reg.register_method(
            "boom",
            sync_method(|_| -> Result<Value, MethodError> { panic!("kaboom") }),
        )
        .unwrap();
        reg.register_method(
            "later",
            async_method(|params: Vec<Value>| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(params.into_iter().next().unwrap_or_default())
            }),
        )
        .unwrap();
        reg.register_method(
            "late_boom",
            async_method(|params: Vec<Value>| async move {
                if params.is_empty() {
                    panic!("async kaboom");
                }
                Ok(Value::Null)
            }),
        )
        .unwrap();
        reg.register_method(
            "forever",
            async_method(|_| futures::future::pending::<Result<Value, MethodError>>()),
        )
        .unwrap();
        Arc::new(reg)
    }

    fn setup() -> (MethodInvoker, Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = Arc::new(Connection::new(
            ConnectionId::new(),
            tx,
            CancellationToken::new(),
        ));
        (
            MethodInvoker::new(registry(), Duration::from_secs(60)),
            conn,
            rx,
        )
    }

    fn call(id: &str, method: &str, params: Vec<Value>) -> MethodCall {
        MethodCall {
            id: id.into(),
            method: method.into(),
            params,
            random_seed: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn ready_result_then_updated() {
        let (invoker, conn, mut rx) = setup();
        let mut pending = JoinSet::new();
        invoker
            .invoke(
                call("1", "sum", vec![Value::from(2), Value::from(3)]),
                &conn,
                &mut pending,
            )
            .await;
        assert_eq!(next(&mut rx).await, json!({"msg": "result", "id": "1", "result": 5}));
        assert_eq!(next(&mut rx).await, json!({"msg": "updated", "methods": ["1"]}));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn handler_error_is_structured() {
        let (invoker, conn, mut rx) = setup();
        let mut pending = JoinSet::new();
        invoker.invoke(call("2", "fail", vec![]), &conn, &mut pending).await;
        assert_eq!(
            next(&mut rx).await,
            json!({"msg": "result", "id": "2", "error": {"error": "Error: nope", "message": "nope"}})
        );
        assert_eq!(next(&mut rx).await["msg"], "updated");
    }

    #[tokio::test]
    async fn unknown_method_reports_not_found() {
        let (invoker, conn, mut rx) = setup();
        let mut pending = JoinSet::new();
        invoker.invoke(call("3", "missing", vec![]), &conn, &mut pending).await;
        let result = next(&mut rx).await;
        assert_eq!(result["error"]["error"], "Error: Method not found ('missing')");
        assert_eq!(next(&mut rx).await, json!({"msg": "updated", "methods": ["3"]}));
    }

    #[tokio::test]
    async fn sync_panic_becomes_error_result() {
        let (invoker, conn, mut rx) = setup();
        let mut pending = JoinSet::new();
        invoker.invoke(call("4", "boom", vec![]), &conn, &mut pending).await;
        let result = next(&mut rx).await;
        assert_eq!(result["error"]["message"], "Method 'boom' panicked");
        assert_eq!(next(&mut rx).await["msg"], "updated");
    }

    #[tokio::test]
    async fn pending_sends_updated_first() {
        let (invoker, conn, mut rx) = setup();
        let mut pending = JoinSet::new();
        invoker
            .invoke(call("5", "later", vec![Value::from("x")]), &conn, &mut pending)
            .await;
        assert_eq!(next(&mut rx).await, json!({"msg": "updated", "methods": ["5"]}));
        assert_eq!(next(&mut rx).await, json!({"msg": "result", "id": "5", "result": "x"}));
        while pending.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn async_panic_becomes_error_result() {
        let (invoker, conn, mut rx) = setup();
        let mut pending = JoinSet::new();
        invoker.invoke(call("6", "late_boom", vec![]), &conn, &mut pending).await;
        assert_eq!(next(&mut rx).await["msg"], "updated");
        let result = next(&mut rx).await;
        assert_eq!(result["error"]["message"], "Method 'late_boom' panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn pending_times_out() {
        let (tx, mut rx) = mpsc::channel(32);
        let conn = Arc::new(Connection::new(
            ConnectionId::new(),
            tx,
            CancellationToken::new(),
        ));
        let invoker = MethodInvoker::new(registry(), Duration::from_secs(1));
        let mut pending = JoinSet::new();
        invoker.invoke(call("7", "forever", vec![]), &conn, &mut pending).await;
        assert_eq!(next(&mut rx).await["msg"], "updated");
        let result = next(&mut rx).await;
        assert_eq!(result["error"]["message"], "Method 'forever' timed out");
    }

    #[tokio::test]
    async fn aborted_pending_sends_nothing() {
        let (invoker, conn, mut rx) = setup();
        let mut pending = JoinSet::new();
        invoker.invoke(call("8", "forever", vec![]), &conn, &mut pending).await;
        assert_eq!(next(&mut rx).await["msg"], "updated");
        pending.shutdown().await;
        drop(conn);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn panic_message_extracts_payload() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("borrowed");
        let other: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*borrowed), "borrowed");
        assert_eq!(panic_message(&*other), "unknown panic");
    }
}
