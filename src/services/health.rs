//! Health check HTTP server for the consumer process
//!
//! Provides liveness and readiness probes for process supervision and a
//! Prometheus metrics endpoint fed by the processor statistics.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::adapters::traits::OrderStore;
use crate::coordination::shutdown::ShutdownListener;
use crate::coordination::supervisor::ConnectionEvent;
use crate::error::{OrderflowError, Result};
use crate::pipeline::processor::ProcessorStats;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

/// Overall health response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor: Option<ProcessorStats>,
}

/// Shared state for health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub broker_connected: AtomicBool,
    /// Connections established after the first one
    pub broker_reconnects: AtomicU64,
    pub last_broker_event: RwLock<Option<DateTime<Utc>>>,
    pub db_connected: AtomicBool,
    pub last_db_check: RwLock<Option<DateTime<Utc>>>,
    pub processor_stats: Option<Arc<RwLock<ProcessorStats>>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            broker_connected: AtomicBool::new(false),
            broker_reconnects: AtomicU64::new(0),
            last_broker_event: RwLock::new(None),
            db_connected: AtomicBool::new(false),
            last_db_check: RwLock::new(None),
            processor_stats: None,
        }
    }

    pub fn with_processor_stats(mut self, stats: Arc<RwLock<ProcessorStats>>) -> Self {
        self.processor_stats = Some(stats);
        self
    }

    pub async fn apply_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { generation } => {
                self.broker_connected.store(true, Ordering::SeqCst);
                if *generation > 1 {
                    self.broker_reconnects.fetch_add(1, Ordering::SeqCst);
                }
            }
            ConnectionEvent::Disconnected { .. } => {
                self.broker_connected.store(false, Ordering::SeqCst);
            }
        }
        *self.last_broker_event.write().await = Some(Utc::now());
    }

    /// Follow supervisor events until the sender goes away
    pub fn track_connection(self: &Arc<Self>, mut events: broadcast::Receiver<ConnectionEvent>) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => state.apply_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Health tracker skipped {} connection events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn record_db_check(&self, success: bool) {
        *self.last_db_check.write().await = Some(Utc::now());
        self.db_connected.store(success, Ordering::SeqCst);
    }

    /// Ping the store every `interval` until shutdown
    pub fn probe_store(
        self: &Arc<Self>,
        store: Arc<dyn OrderStore>,
        interval: Duration,
        mut shutdown: ShutdownListener,
    ) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let ok = store.ping().await.is_ok();
                state.record_db_check(ok).await;
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    pub async fn get_health(&self) -> HealthResponse {
        let mut components = Vec::new();

        // The consumer cannot make progress without the broker
        let broker_connected = self.broker_connected.load(Ordering::SeqCst);
        let broker_status = if broker_connected {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        components.push(ComponentHealth {
            name: "broker".to_string(),
            status: broker_status,
            message: (!broker_connected).then(|| "Reconnecting".to_string()),
            last_check: *self.last_broker_event.read().await,
        });

        // Store outages only defer deliveries
        let db_connected = self.db_connected.load(Ordering::SeqCst);
        let db_status = if db_connected {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        components.push(ComponentHealth {
            name: "database".to_string(),
            status: db_status,
            message: (!db_connected).then(|| "Disconnected".to_string()),
            last_check: *self.last_db_check.read().await,
        });

        let status = if broker_status == HealthStatus::Unhealthy {
            HealthStatus::Unhealthy
        } else if db_status != HealthStatus::Healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let processor = match &self.processor_stats {
            Some(stats) => Some(stats.read().await.clone()),
            None => None,
        };

        HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            components,
            processor,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    pub async fn run(&self, mut shutdown: ShutdownListener) -> Result<()> {
        let app = health_router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
            .map_err(|e| OrderflowError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.broker_connected.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let health_status = match health.status {
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 0,
        HealthStatus::Unhealthy => -1,
    };
    let broker_connected = u8::from(state.broker_connected.load(Ordering::SeqCst));
    let db_connected = u8::from(state.db_connected.load(Ordering::SeqCst));
    let reconnects = state.broker_reconnects.load(Ordering::SeqCst);
    let stats = health.processor.unwrap_or_default();

    let metrics = format!(
        r#"# HELP orderflow_up Health status (1=healthy, 0=degraded, -1=unhealthy)
# TYPE orderflow_up gauge
orderflow_up {}

# HELP orderflow_uptime_seconds Uptime in seconds
# TYPE orderflow_uptime_seconds counter
orderflow_uptime_seconds {}

# HELP orderflow_broker_connected Broker connection status
# TYPE orderflow_broker_connected gauge
orderflow_broker_connected {}

# HELP orderflow_broker_reconnects_total Broker reconnections
# TYPE orderflow_broker_reconnects_total counter
orderflow_broker_reconnects_total {}

# HELP orderflow_database_connected Database connection status
# TYPE orderflow_database_connected gauge
orderflow_database_connected {}

# HELP orderflow_deliveries_received_total Deliveries received
# TYPE orderflow_deliveries_received_total counter
orderflow_deliveries_received_total {}

# HELP orderflow_orders_completed_total Orders completed
# TYPE orderflow_orders_completed_total counter
orderflow_orders_completed_total {}

# HELP orderflow_deliveries_duplicate_total Deliveries short-circuited by the ledger
# TYPE orderflow_deliveries_duplicate_total counter
orderflow_deliveries_duplicate_total {}

# HELP orderflow_orders_retried_total Deliveries sent to the retry queue
# TYPE orderflow_orders_retried_total counter
orderflow_orders_retried_total {}

# HELP orderflow_orders_failed_total Orders parked in the failed queue
# TYPE orderflow_orders_failed_total counter
orderflow_orders_failed_total {}

# HELP orderflow_deliveries_malformed_total Malformed deliveries
# TYPE orderflow_deliveries_malformed_total counter
orderflow_deliveries_malformed_total {}

# HELP orderflow_deliveries_deferred_total Deliveries deferred by store outages
# TYPE orderflow_deliveries_deferred_total counter
orderflow_deliveries_deferred_total {}
"#,
        health_status,
        health.uptime_seconds,
        broker_connected,
        reconnects,
        db_connected,
        stats.received,
        stats.completed,
        stats.duplicates,
        stats.retried,
        stats.failed,
        stats.malformed,
        stats.deferred,
    );

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        metrics,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_state_new() {
        let state = HealthState::new();
        assert!(!state.broker_connected.load(Ordering::SeqCst));
        assert!(!state.db_connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unhealthy_without_broker() {
        let state = HealthState::new();
        state.record_db_check(true).await;
        assert_eq!(state.get_health().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_connection_events_update_state() {
        let state = HealthState::new();
        state.record_db_check(true).await;

        state
            .apply_event(&ConnectionEvent::Connected { generation: 1 })
            .await;
        assert_eq!(state.get_health().await.status, HealthStatus::Healthy);

        state
            .apply_event(&ConnectionEvent::Disconnected {
                generation: 1,
                reason: "gone".into(),
            })
            .await;
        state
            .apply_event(&ConnectionEvent::Connected { generation: 2 })
            .await;
        assert_eq!(state.broker_reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_database_outage_degrades() {
        let state = HealthState::new();
        state
            .apply_event(&ConnectionEvent::Connected { generation: 1 })
            .await;
        state.record_db_check(false).await;
        assert_eq!(state.get_health().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_processor_stats_are_reported() {
        let stats = Arc::new(RwLock::new(ProcessorStats {
            completed: 3,
            ..Default::default()
        }));
        let state = HealthState::new().with_processor_stats(stats);
        let health = state.get_health().await;
        assert_eq!(health.processor.unwrap().completed, 3);
    }
}
