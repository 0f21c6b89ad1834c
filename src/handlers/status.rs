//! Watchdog status endpoint handler.

use axum::{extract::State, Json};
use tracing::{debug, instrument};

use crate::state::SharedState;
use crate::watchdog::StatusSummary;

/// Handler for the /status endpoint: current counters, restart history and
/// last restart time as JSON.
#[instrument(skip(state))]
pub async fn status_handler(State(state): State<SharedState>) -> Json<StatusSummary> {
    debug!("Processing /status request");
    Json(state.engine.status_summary().await)
}
