//! Session observability and cancellation routes.

use crate::streaming::SessionSnapshot;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::server::AppContext;

pub fn session_routes() -> Router<AppContext> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(cancel_session))
}

/// Snapshot of all active sessions.
async fn list_sessions(State(ctx): State<AppContext>) -> Json<Vec<SessionSnapshot>> {
    Json(ctx.registry.list())
}

async fn get_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    let id: Uuid = id.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    ctx.registry
        .get(id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Cancel an active session: trips its cancellation token, which tears the
/// stream and any encoder process down.
async fn cancel_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> StatusCode {
    let id: Uuid = match id.parse() {
        Ok(id) => id,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    if ctx.registry.cancel(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
