//! Health check endpoint handler.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Handler for the /health endpoint.
///
/// Reports the daemon's own liveness, not the game server's; the managed
/// server being down is exactly the situation this daemon exists for.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    let summary = state.engine.status_summary().await;
    let body = format!(
        "OK\n\nuptime_seconds: {}\nserver_running: {}\nrestarts_last_hour: {}\n",
        state.uptime_secs(),
        summary.server_running,
        summary.restarts_last_hour
    );

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        body,
    )
}
