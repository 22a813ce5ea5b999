//! Health, discovery, config echo, resolve, and actuator routes.

use super::{ApiState, require_str, respond};
use crate::error::BridgeError;
use crate::{ConversationId, ThreadId};

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// `/health`: the adapter's discovery handshake reads
/// `workspaceFolders` off this response to pick the right instance.
pub(super) async fn health(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "workspaceFolders": state.workspace_folders,
        "workspaceName": state.workspace_name,
        "discordConnected": state.connected.load(Ordering::Relaxed),
    }))
}

pub(super) async fn config_echo(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let config = state.config.load();
    Json(json!({
        "guildId": config.global.guild_id,
        "channelId": config.project.channel_id,
        "channelName": config.project.channel_name,
        "workspaceName": state.workspace_name,
    }))
}

/// `/api/get-active-thread-id`: runs the three-strategy resolve.
pub(super) async fn get_active_thread_id(
    State(state): State<Arc<ApiState>>,
) -> (StatusCode, Json<Value>) {
    match state.resolver.resolve().await {
        Ok(resolved) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "threadId": resolved.mapping.thread_id,
                "chatId": resolved.mapping.conversation_id,
                "method": resolved.method,
            })),
        ),
        Err(BridgeError::Timeout) => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "no mappings" })),
        ),
        Err(error) => respond(Err(error)),
    }
}

/// `/message`: drive the IDE-side actuator directly.
pub(super) async fn message(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let result = async {
        let conversation_id = ConversationId::from(require_str(&body, "conversationId")?);
        let text = require_str(&body, "message")?;
        let thread_id = body
            .get("threadId")
            .and_then(Value::as_str)
            .map(ThreadId::from);
        state
            .delivery
            .deliver(&conversation_id, text, thread_id.as_ref())
            .await?;
        Ok(json!({ "success": true }))
    }
    .await;
    respond(result)
}

pub(super) async fn reconnect(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    match &state.reconnect_tx {
        Some(tx) => {
            let _ = tx.send(()).await;
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        None => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "reconnect not available" })),
        ),
    }
}
