//! Liveness and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use tracing::warn;

use super::AppState;

/// Liveness: 200 OK whenever the server is accepting connections.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness: 200 when the database answers a query, 503 otherwise.
pub async fn ready_handler(State(app_state): State<AppState>) -> (StatusCode, &'static str) {
    match app_state.store().ping().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}
