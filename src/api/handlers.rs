use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::error::ApiError;
use super::AppState;
use crate::relay;
use crate::session::SessionState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
    /// Sessions whose backend connection is up.
    active: usize,
    backends: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = state.sessions.snapshot();
    Json(HealthResponse {
        status: "ok",
        sessions: sessions.len(),
        active: sessions
            .iter()
            .filter(|s| s.state == SessionState::Active)
            .count(),
        backends: state.sessions.sockets().get(),
    })
}

/// Push-connection endpoint. Admission (identifier draw and session limit)
/// happens before the upgrade so a full server answers with a plain 503.
pub(super) async fn ws_session(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }

    let id = state.relay.ids.next_id();
    let slot = state.sessions.admit(id).map_err(|e| {
        tracing::warn!(error = %e, "rejecting push connection");
        ApiError::from(e)
    })?;

    Ok(ws
        .on_upgrade(move |socket| relay::run_session(socket, slot, state))
        .into_response())
}
