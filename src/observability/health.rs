//! Health check HTTP server for container orchestration
//!
//! Exposes the supervisor state and the connectivity metrics to operators
//! and orchestration probes.

use crate::observability::metrics::{ConnectivityMetrics, ConnectivitySnapshot};
use crate::supervisor::{ConnectionSupervisor, SupervisorState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    state_rx: watch::Receiver<SupervisorState>,
    metrics: Arc<ConnectivityMetrics>,
    started_at: DateTime<Utc>,
}

impl HealthServer {
    pub fn new(
        port: u16,
        state_rx: watch::Receiver<SupervisorState>,
        metrics: Arc<ConnectivityMetrics>,
    ) -> Self {
        Self {
            port,
            state_rx,
            metrics,
            started_at: Utc::now(),
        }
    }

    /// Health server reporting on `supervisor`
    pub fn for_supervisor(supervisor: &ConnectionSupervisor, port: u16) -> Self {
        Self::new(port, supervisor.subscribe_state(), supervisor.metrics())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    fn health_status(&self) -> HealthStatus {
        let state = self.state();
        let now = Utc::now();
        HealthStatus {
            status: if state.is_connected() {
                "healthy"
            } else {
                "unhealthy"
            },
            state,
            timestamp: now,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            connectivity: self.metrics.snapshot(),
        }
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let health_server = Arc::clone(&self);
        let metrics_server = Arc::clone(&self);
        let ready_server = Arc::clone(&self);

        // GET /health - state plus connectivity
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&health_server);
                async move {
                    let status = server.health_status();
                    let code = if status.state.is_connected() {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&status),
                        code,
                    ))
                }
            });

        // GET /metrics - connectivity snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&metrics_server);
                async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics.snapshot())) }
            });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&ready_server);
                async move {
                    let state = server.state();
                    let response = ReadinessResponse {
                        ready: state.is_connected(),
                        state,
                        timestamp: Utc::now(),
                    };
                    let code = if response.ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&response),
                        code,
                    ))
                }
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: Utc::now(),
                })
            });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints = BTreeMap::from([
                ("/health", "Supervisor state and connectivity"),
                ("/metrics", "Connectivity metrics snapshot"),
                ("/ready", "Readiness probe, ready while connected"),
                ("/live", "Liveness probe"),
            ]);
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        tracing::info!(port = self.port, "Starting health server");
        warp::serve(self.routes()).run(addr).await;
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthStatus {
    status: &'static str,
    state: SupervisorState,
    timestamp: DateTime<Utc>,
    uptime_seconds: u64,
    connectivity: ConnectivitySnapshot,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    state: SupervisorState,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}
