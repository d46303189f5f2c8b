//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

use crate::rpc::registry::Registry;

/// Whether the server still accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Accepting connections.
    Ok,
    /// Shutdown has begun; new connections are refused.
    Draining,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Serving state.
    pub status: HealthStatus,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open DDP connections.
    pub connections: usize,
    /// Registered method count.
    pub methods: usize,
    /// Registered publication count.
    pub publications: usize,
}

/// Snapshot the server's health.
pub fn health_check(
    start_time: Instant,
    registry: &Registry,
    connections: usize,
    draining: bool,
) -> HealthResponse {
    HealthResponse {
        status: if draining {
            HealthStatus::Draining
        } else {
            HealthStatus::Ok
        },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        methods: registry.method_count(),
        publications: registry.publication_count(),
    }
}
