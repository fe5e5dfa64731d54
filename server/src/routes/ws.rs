//! WebSocket endpoint.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tandem_engine::User;

use crate::error::{AppError, Result};
use crate::handlers::handle_websocket_connection;
use crate::AppState;

/// Query string of a connect request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// JSON-encoded local participant
    pub user: Option<String>,
}

/// Create WebSocket routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/{project_id}", get(ws_handler))
}

/// Parse the `user` query parameter.
pub fn parse_user(raw: Option<&str>) -> Result<User> {
    let raw = raw.ok_or_else(|| AppError::BadRequest("missing `user` query parameter".into()))?;
    serde_json::from_str(raw)
        .map_err(|e| AppError::BadRequest(format!("invalid `user` query parameter: {}", e)))
}

/// GET /ws/{project_id}?user=<json> - Join a project.
///
/// The user and project id are checked before the upgrade itself, so a bad
/// request gets a JSON error even from a plain HTTP client.
async fn ws_handler(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(params): Query<ConnectParams>,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let user = parse_user(params.user.as_deref())?;
    crate::storage::validate_project_id(&project_id)?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let hub = state.registry.open(&project_id).await?;
    let registry = state.registry.clone();

    Ok(ws.on_upgrade(move |socket| handle_websocket_connection(socket, registry, hub, user)))
}
