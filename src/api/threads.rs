//! Thread-addressed routes. All of them require an explicit `threadId`
//! (the typing routes degrade to a no-op success without one).

use super::{ApiState, require_str, respond};
use crate::gateway::FilePayload;
use crate::gateway::format::PLACEHOLDER_NAME;
use crate::error::BridgeError;
use crate::{ConversationId, ThreadId};

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use base64::Engine as _;
use serde_json::{Value, json};
use std::sync::Arc;

pub(super) async fn post_to_thread(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let result = async {
        let thread_id = ThreadId::from(require_str(&body, "threadId")?);
        let text = require_str(&body, "text")?;
        let as_embed = body.get("asEmbed").and_then(Value::as_bool).unwrap_or(false);
        state.chat.post_to_thread(&thread_id, text, as_embed).await?;
        Ok(json!({ "success": true }))
    }
    .await;
    respond(result)
}

pub(super) async fn send_file_to_thread(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let result = async {
        let thread_id = ThreadId::from(require_str(&body, "threadId")?);
        let file_name = body.get("fileName").and_then(Value::as_str);
        let description = body.get("description").and_then(Value::as_str);

        // A base64 payload wins over a path: remote adapters pre-read
        // the file because this host cannot dereference their paths.
        let payload = if let Some(encoded) = body.get("fileContentBase64").and_then(Value::as_str) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|error| {
                    BridgeError::TransientIo(format!("invalid base64 payload: {error}"))
                })?;
            FilePayload::Bytes(bytes)
        } else if let Some(path) = body.get("filePath").and_then(Value::as_str) {
            FilePayload::Path(path.into())
        } else {
            return Err(BridgeError::MissingParameter("filePath or fileContentBase64"));
        };

        state
            .chat
            .send_file(&thread_id, payload, file_name, description)
            .await?;
        Ok(json!({ "success": true }))
    }
    .await;
    respond(result)
}

pub(super) async fn start_typing(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    typing(state, body, true).await
}

pub(super) async fn stop_typing(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    typing(state, body, false).await
}

async fn typing(
    state: Arc<ApiState>,
    body: Value,
    start: bool,
) -> (StatusCode, Json<Value>) {
    // Without a thread id the request is a no-op success by contract.
    let Some(thread_id) = body
        .get("threadId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(ThreadId::from)
    else {
        return (StatusCode::OK, Json(json!({ "success": true, "noop": true })));
    };

    let result = async {
        if start {
            state.chat.start_typing(&thread_id).await?;
        } else {
            state.chat.stop_typing(&thread_id).await?;
        }
        Ok(json!({ "success": true }))
    }
    .await;
    respond(result)
}

pub(super) async fn create_thread(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let result = async {
        let conversation_id = ConversationId::from(require_str(&body, "conversationId")?);
        let name = body
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(PLACEHOLDER_NAME);
        let thread_id = state.chat.create_thread(&conversation_id, name).await?;
        Ok(json!({ "success": true, "threadId": thread_id }))
    }
    .await;
    respond(result)
}

pub(super) async fn rename_thread(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let result = async {
        let thread_id = ThreadId::from(require_str(&body, "threadId")?);
        let name = require_str(&body, "name")?;
        state.chat.rename_thread(&thread_id, name).await?;
        Ok(json!({ "success": true }))
    }
    .await;
    respond(result)
}

/// Post the user's own prompt into the thread, visually distinct from
/// agent output.
pub(super) async fn forward_user_prompt(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let result = async {
        let thread_id = ThreadId::from(require_str(&body, "threadId")?);
        let prompt = require_str(&body, "prompt")?;
        let formatted = format_user_prompt(prompt);
        state.chat.post_to_thread(&thread_id, &formatted, false).await?;
        Ok(json!({ "success": true }))
    }
    .await;
    respond(result)
}

fn format_user_prompt(prompt: &str) -> String {
    let quoted = prompt
        .lines()
        .map(|line| format!("> {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("💬 **User prompt**\n{quoted}")
}
