//! Manual restart trigger endpoint handler.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::state::SharedState;

#[derive(Serialize)]
pub struct RestartResponse {
    pub accepted: bool,
    pub message: String,
}

/// Handler for POST /restart.
///
/// Rate-limited so a flapping automation or a nervous operator cannot
/// hammer the server with restarts: denial is 429 with a retry hint,
/// distinct from 500 when the restart procedure itself fails.
#[instrument(skip(state))]
pub async fn restart_handler(State(state): State<SharedState>) -> impl IntoResponse {
    if !state.restart_limiter.allow("manual_restart").await {
        let retry_after = state.restart_limiter.retry_after_secs("manual_restart").await;
        warn!("manual restart denied by rate limit");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RestartResponse {
                accepted: false,
                message: format!("rate limited, try again in {retry_after}s"),
            }),
        );
    }

    info!("manual restart requested via HTTP");
    if state.engine.force_restart("manual request").await {
        (
            StatusCode::OK,
            Json(RestartResponse {
                accepted: true,
                message: "restart completed".to_string(),
            }),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RestartResponse {
                accepted: false,
                message: "restart failed, see daemon logs".to_string(),
            }),
        )
    }
}
