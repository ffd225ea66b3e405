use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use tracing::error;

use kindroom_types::models::RoomId;

use crate::connection::{self, ConnectionSettings};
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct GatewayState {
    pub pipeline: Pipeline,
    pub settings: ConnectionSettings,
}

/// Realtime routes: `GET /ws/{room_id}` and `GET /health`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/{room_id}", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    Path(room_id): Path<RoomId>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    // Only existing rooms accept connections.
    match state.pipeline.repository().get_room(room_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, room_id, "Room lookup failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.pipeline, state.settings, room_id)
    }))
}

async fn health() -> &'static str {
    "ok"
}
