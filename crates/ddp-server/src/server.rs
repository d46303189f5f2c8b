//! `DdpServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use ddp_core::ConnectionId;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::errors::{RegistryError, ServerError};
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::rpc::registry::{Method, Publication, Registry};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SessionContext, run_ws_session};
use crate::websocket::tracker::ConnectionTracker;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Methods and publications, frozen.
    pub registry: Arc<Registry>,
    /// Server settings.
    pub config: Arc<ServerConfig>,
    /// Open connections.
    pub tracker: Arc<ConnectionTracker>,
    /// One permit per allowed connection, taken before the upgrade.
    pub slots: Arc<Semaphore>,
    /// Shutdown coordinator.
    pub shutdown: ShutdownCoordinator,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Claim a connection slot, or `None` at `max_connections`. The slot is
    /// released when the permit drops.
    pub fn reserve_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
            tracker: Arc::clone(&self.tracker),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Server builder. Register methods and publications, then
/// [`serve`](Self::serve).
pub struct DdpServer {
    config: ServerConfig,
    registry: Registry,
    metrics: Option<PrometheusHandle>,
}

impl DdpServer {
    /// Create a server with an empty registry.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            metrics: None,
        }
    }

    /// Register a method.
    pub fn method(
        &mut self,
        name: &str,
        method: impl Method + 'static,
    ) -> Result<&mut Self, RegistryError> {
        self.registry.register_method(name, method)?;
        Ok(self)
    }

    /// Register several methods, failing at the first duplicate.
    pub fn methods<N: Into<String>>(
        &mut self,
        methods: impl IntoIterator<Item = (N, Arc<dyn Method>)>,
    ) -> Result<&mut Self, RegistryError> {
        self.registry.register_methods(methods)?;
        Ok(self)
    }

    /// Register a publication.
    pub fn publish(
        &mut self,
        name: &str,
        publication: impl Publication + 'static,
    ) -> Result<&mut Self, RegistryError> {
        self.registry.register_publication(name, publication)?;
        Ok(self)
    }

    /// Register several publications, failing at the first duplicate.
    pub fn publications<N: Into<String>>(
        &mut self,
        publications: impl IntoIterator<Item = (N, Arc<dyn Publication>)>,
    ) -> Result<&mut Self, RegistryError> {
        self.registry.register_publications(publications)?;
        Ok(self)
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// The registry being assembled.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn into_state(self) -> AppState {
        let slots = Semaphore::new(self.config.max_connections.min(Semaphore::MAX_PERMITS));
        AppState {
            registry: Arc::new(self.registry),
            config: Arc::new(self.config),
            tracker: Arc::new(ConnectionTracker::new()),
            slots: Arc::new(slots),
            shutdown: ShutdownCoordinator::new(),
            start_time: Instant::now(),
            metrics: self.metrics,
        }
    }

    /// Freeze the registry, bind the listener and start accepting.
    pub async fn serve(self) -> Result<ServerHandle, ServerError> {
        let state = self.into_state();
        let listener = tokio::net::TcpListener::bind(state.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            methods = ?state.registry.method_names(),
            publications = ?state.registry.publication_names(),
            "DDP server listening"
        );

        let router = build_router(state.clone());
        let token = state.shutdown.token();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(error = %err, "server stopped with error");
            }
        });

        Ok(ServerHandle {
            local_addr,
            state,
            server,
        })
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/websocket", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: AppState,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients connect to.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/websocket", self.local_addr)
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.state.tracker.count().await
    }

    /// Stop accepting and close every connection. Idempotent.
    pub fn close(&self) {
        if !self.state.shutdown.is_shutting_down() {
            info!(addr = %self.local_addr, "closing DDP server");
        }
        self.state.shutdown.shutdown();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.shutdown.is_shutting_down()
    }

    /// Close, then wait up to `timeout` for the accept loop and every
    /// session to finish. Returns `false` on timeout.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.close();
        let tracker = Arc::clone(&self.state.tracker);
        let drain = tokio::spawn(async move { tracker.wait_idle().await });
        self.state
            .shutdown
            .graceful_shutdown(vec![self.server, drain], Some(timeout))
            .await
    }
}

/// GET / and /websocket
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    let Some(slot) = state.reserve_slot() else {
        warn!(max = state.config.max_connections, "connection limit reached, rejecting");
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let ctx = state.session_context();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            run_ws_session(socket, ConnectionId::new(), ctx).await;
            drop(slot);
        })
        .into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.tracker.count().await;
    Json(health::health_check(
        state.start_time,
        &state.registry,
        connections,
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
