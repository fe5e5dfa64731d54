//! WebSocket handler for project connections.
//!
//! Each connection gets a forwarder task draining its outbound queue into the
//! socket, while the handler itself reads frames and hands them to the hub.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tandem_engine::{InboundFrame, PresenceMessage, User};
use tokio::sync::mpsc;

use crate::hub::{HubRegistry, ProjectHub};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Joins the project hub, which queues the document and roster
/// 2. Spawns a task to forward outgoing frames
/// 3. Processes incoming frames in a loop
/// 4. Leaves the hub and persists the document on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    registry: Arc<HubRegistry>,
    hub: Arc<ProjectHub>,
    user: User,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let user_id = user.id.clone();
    let conn_id = match hub.join(user, tx) {
        Ok(conn_id) => conn_id,
        Err(e) => {
            tracing::error!(project_id = %hub.project_id(), error = %e, "Failed to join project");
            return;
        }
    };

    tracing::info!(
        conn_id = %conn_id,
        user_id = %user_id,
        project_id = %hub.project_id(),
        "WebSocket client connected"
    );

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame.into())).await {
                tracing::warn!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => process_frame(&hub, &conn_id, text.as_str()),
            Ok(Message::Binary(_)) => {
                tracing::warn!(conn_id = %conn_id, "Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    // Clean up
    hub.leave(&conn_id);
    send_task.abort();

    if let Err(e) = registry.persist(&hub).await {
        tracing::error!(project_id = %hub.project_id(), error = %e, "Failed to persist document");
    }

    tracing::info!(
        conn_id = %conn_id,
        user_id = %user_id,
        active_connections = hub.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Route one inbound frame. Frames that do not decode are logged and dropped.
pub fn process_frame(hub: &ProjectHub, conn_id: &str, text: &str) {
    let frame = match InboundFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, error = %e, "Dropping malformed frame");
            return;
        }
    };

    match frame {
        InboundFrame::Patch(patch) => {
            let outcome = hub.apply_patch(conn_id, text, &patch);
            tracing::debug!(conn_id = %conn_id, ops = patch.len(), sent_to = outcome.sent, "Patch relayed");
            if let Err(e) = outcome.applied {
                tracing::warn!(conn_id = %conn_id, error = %e, "Patch relayed but not stored");
            }
        }
        InboundFrame::Presence(PresenceMessage::UserUpdate(user)) => {
            if let Err(e) = hub.update_user(conn_id, user) {
                tracing::warn!(conn_id = %conn_id, error = %e, "Failed to relay user update");
            }
        }
        InboundFrame::Presence(other) => {
            tracing::warn!(conn_id = %conn_id, message = ?other, "Clients may only send USER_UPDATE");
        }
    }
}
