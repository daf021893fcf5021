//! Health check endpoints

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use crate::daemon::DaemonHandle;
use crate::session::{Stage, StatusState};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub has_key: bool,
    pub require_setup: bool,
}

/// Current session state
#[derive(Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub speaking: bool,
    pub stage: Stage,
    pub status: String,
    pub state: StatusState,
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - can listening start?
async fn ready(State(daemon): State<DaemonHandle>) -> (StatusCode, Json<ReadinessResponse>) {
    match daemon.config().await {
        Ok(view) => {
            let (code, status) = if view.has_key {
                (StatusCode::OK, "ok")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "setup_required")
            };
            (
                code,
                Json(ReadinessResponse {
                    status,
                    has_key: view.has_key,
                    require_setup: view.require_setup,
                }),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "unavailable",
                    has_key: false,
                    require_setup: true,
                }),
            )
        }
    }
}

async fn status(State(daemon): State<DaemonHandle>) -> Json<StatusResponse> {
    let snapshot = daemon.snapshot();
    Json(StatusResponse {
        running: snapshot.running,
        speaking: snapshot.speaking,
        stage: snapshot.stage,
        status: snapshot.status,
        state: snapshot.status_state,
    })
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Build readiness and status router
pub fn state_router(daemon: DaemonHandle) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/status", get(status))
        .with_state(daemon)
}
