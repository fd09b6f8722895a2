//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, queue feed status, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - liveness probe (always OK)
//! - `GET /readyz` - readiness probe (last queue pop succeeded)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::PriceSink;
use crate::application::services::{EngineStatsSnapshot, PriceEngine};
use crate::domain::subscription::RegistryStats;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Status Source
// =============================================================================

/// Read-only view of the relay used by the health endpoints.
pub trait RelayStatus: Send + Sync {
    /// Engine counters.
    fn engine_stats(&self) -> EngineStatsSnapshot;
    /// Live subscribers.
    fn subscribers(&self) -> RegistryStats;
    /// Symbols in the cache.
    fn cached_symbols(&self) -> usize;
    /// Time since startup.
    fn uptime(&self) -> Duration;
}

impl<S: PriceSink> RelayStatus for PriceEngine<S> {
    fn engine_stats(&self) -> EngineStatsSnapshot {
        self.stats().snapshot()
    }

    fn subscribers(&self) -> RegistryStats {
        self.registry().stats()
    }

    fn cached_symbols(&self) -> usize {
        self.cache().len()
    }

    fn uptime(&self) -> Duration {
        Self::uptime(self)
    }
}

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream queue state.
    pub queue: QueueStatus,
    /// Live subscriber counts.
    pub subscribers: SubscriberStatus,
    /// Symbols with a cached price.
    pub cached_symbols: usize,
    /// Engine counters.
    pub counters: EngineStatsSnapshot,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Queue reachable.
    Healthy,
    /// Queue unreachable, cached prices still served.
    Degraded,
    /// Queue unreachable and nothing was ever received.
    Unhealthy,
}

/// Upstream queue state.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Whether the most recent pop succeeded.
    pub connected: bool,
    /// When the last event was published.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Most recent pop error.
    pub last_error: Option<String>,
}

/// Live subscriber counts.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatus {
    /// Unfiltered streams.
    pub broadcast: usize,
    /// Per-position streams.
    pub position: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    relay: Arc<dyn RelayStatus>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, relay: Arc<dyn RelayStatus>) -> Self {
        Self { version, relay }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already-bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::ServerFailed` on a fatal server error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HealthServerError> {
        tracing::info!(addr = ?listener.local_addr().ok(), "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.relay.engine_stats().queue_healthy {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let counters = state.relay.engine_stats();
    let subscribers = state.relay.subscribers();

    HealthResponse {
        status: determine_health_status(&counters),
        version: state.version.clone(),
        uptime_secs: state.relay.uptime().as_secs(),
        current_time: Utc::now(),
        queue: QueueStatus {
            connected: counters.queue_healthy,
            last_event_at: counters.last_event_at,
            last_error: counters.last_error.clone(),
        },
        subscribers: SubscriberStatus {
            broadcast: subscribers.broadcast,
            position: subscribers.position,
        },
        cached_symbols: state.relay.cached_symbols(),
        counters,
    }
}

fn determine_health_status(counters: &EngineStatsSnapshot) -> HealthStatus {
    match (counters.queue_healthy, counters.last_event_at.is_some()) {
        (true, _) => HealthStatus::Healthy,
        (false, true) => HealthStatus::Degraded,
        (false, false) => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::domain::price::PriceEvent;

    type Engine = PriceEngine<mpsc::Sender<PriceEvent>>;

    fn counters(queue_healthy: bool, received: bool) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            events_published: u64::from(received),
            events_delivered: 0,
            decode_failures: 0,
            sentinels_dropped: 0,
            pop_errors: u64::from(!queue_healthy),
            subscribers_pruned: 0,
            queue_healthy,
            last_event_at: received.then(Utc::now),
            last_error: (!queue_healthy).then(|| "connection refused".to_string()),
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn status_follows_queue_state() {
        assert_eq!(
            determine_health_status(&counters(true, false)),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(&counters(false, true)),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(&counters(false, false)),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn response_reports_cache_and_subscribers() {
        let engine = Arc::new(Engine::with_defaults());
        engine.publish(PriceEvent::new(1, "AAPL", 1.0, 2.0)).await;
        let (tx, _rx) = mpsc::channel(4);
        engine.registry().add_position("c1-AAPL", tx).unwrap();

        let state = HealthServerState::new("0.1.0".to_string(), engine);
        let response = build_health_response(&state);

        assert_eq!(response.status, HealthStatus::Healthy);
        assert_eq!(response.cached_symbols, 1);
        assert_eq!(response.subscribers.position, 1);
        assert_eq!(response.counters.events_published, 1);
        assert!(response.queue.last_event_at.is_some());
    }

    #[tokio::test]
    async fn serves_liveness_over_http() {
        let engine: Arc<dyn RelayStatus> = Arc::new(Engine::with_defaults());
        let state = Arc::new(HealthServerState::new("0.1.0".to_string(), engine));
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HealthServer::new(addr.port(), state, cancel.clone());
        let handle = tokio::spawn(server.serve(listener));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /readyz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();

        assert!(body.starts_with("HTTP/1.1 200"), "{body}");
        assert!(body.ends_with("READY"), "{body}");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
