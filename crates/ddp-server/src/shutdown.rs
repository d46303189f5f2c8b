//! Server-wide cancellation.
//!
//! Every connection token is a child of the coordinator's token, and every
//! subscription token a child of its connection's, so one cancel reaches
//! the whole tree.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long [`ServerHandle::shutdown`](crate::ServerHandle::shutdown)
/// waits by default.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Root of the cancellation tree.
#[derive(Clone, Debug, Default)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
}

impl ShutdownCoordinator {
    /// A coordinator that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// The root token itself.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// A token that fires with the server but can be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Fire the root token. Repeated calls do nothing.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Fire the root token and wait for `tasks` to finish.
    ///
    /// Gives up after `timeout` (or [`DEFAULT_SHUTDOWN_TIMEOUT`]) and
    /// returns `false`; tasks still running are left alone.
    pub async fn graceful_shutdown(
        &self,
        tasks: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> bool {
        let budget = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();

        let pending = tasks.len();
        info!(pending, budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX), "draining");

        match tokio::time::timeout(budget, futures::future::join_all(tasks)).await {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    warn!(panicked, "tasks failed while draining");
                }
                true
            }
            Err(_) => {
                warn!(?budget, "drain timed out");
                false
            }
        }
    }
}
