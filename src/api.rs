//! Loopback RPC surface for out-of-process tool adapters.
//!
//! Binds the first free port in `[19876, 19886)` on `127.0.0.1`. Every
//! thread-addressed route requires an explicit `threadId`; there is no
//! "current thread" fallback, which keeps concurrent agents from
//! cross-talking. Domain errors come back as HTTP 200 with
//! `{success:false}`; missing parameters are HTTP 400.

mod questions;
mod state;
mod system;
mod threads;

pub use state::ApiState;

use crate::error::{BridgeError, Result};

use axum::Router;
use axum::http::StatusCode;
use axum::Json;
use axum::routing::{get, post};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

/// First port probed by the adapter's discovery handshake.
pub const PORT_RANGE_START: u16 = 19876;
/// Number of ports probed before giving up.
pub const PORT_RANGE_LEN: u16 = 10;

/// Bind the first free loopback port in the range.
pub async fn bind_listener() -> Result<(TcpListener, u16)> {
    for port in PORT_RANGE_START..PORT_RANGE_START + PORT_RANGE_LEN {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                tracing::info!(port, "RPC surface listening");
                return Ok((listener, port));
            }
            Err(error) => {
                tracing::debug!(port, %error, "port taken, trying next");
            }
        }
    }
    Err(BridgeError::TransientIo(format!(
        "no free port in {PORT_RANGE_START}..{}",
        PORT_RANGE_START + PORT_RANGE_LEN
    )))
}

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(system::health))
        .route("/api/config", get(system::config_echo))
        .route("/api/get-active-thread-id", get(system::get_active_thread_id))
        .route("/api/reconnect", post(system::reconnect))
        .route("/message", post(system::message))
        .route("/api/post-to-thread", post(threads::post_to_thread))
        .route("/api/send-file-to-thread", post(threads::send_file_to_thread))
        .route("/api/start-typing", post(threads::start_typing))
        .route("/api/stop-typing", post(threads::stop_typing))
        .route("/api/create-thread", post(threads::create_thread))
        .route("/api/rename-thread", post(threads::rename_thread))
        .route("/api/forward-user-prompt", post(threads::forward_user_prompt))
        .route("/api/ask-question", post(questions::ask_question))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

/// Translate a handler result into the wire shape. Permission failures
/// carry an extra flag so the adapter can suggest re-inviting the bot.
pub(crate) fn respond(result: Result<Value>) -> (StatusCode, Json<Value>) {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(error) => {
            let status =
                StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut body = json!({ "success": false, "error": error.to_string() });
            if matches!(error, BridgeError::PermissionDenied(_)) {
                body["permissionError"] = Value::Bool(true);
            }
            (status, Json(body))
        }
    }
}

/// Extract a required string field from a JSON body.
pub(crate) fn require_str<'a>(
    body: &'a Value,
    field: &'static str,
) -> Result<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or(BridgeError::MissingParameter(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_str_rejects_missing_and_empty() {
        let body = json!({ "threadId": "T1", "empty": "" });
        assert_eq!(require_str(&body, "threadId").unwrap(), "T1");
        assert!(matches!(
            require_str(&body, "missing"),
            Err(BridgeError::MissingParameter("missing"))
        ));
        assert!(require_str(&body, "empty").is_err());
    }

    #[test]
    fn respond_maps_error_classes() {
        let (status, _) = respond(Err(BridgeError::MissingParameter("threadId")));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = respond(Err(BridgeError::NotConnected));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["success"], false);
        let (status, body) = respond(Err(BridgeError::Other(anyhow::anyhow!("boom"))));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.0["success"], false);
        let (status, body) = respond(Ok(json!({ "success": true })));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["success"], true);
    }

    #[test]
    fn permission_errors_are_flagged() {
        let (_, body) = respond(Err(BridgeError::PermissionDenied("403".into())));
        assert_eq!(body.0["permissionError"], true);
        let (_, body) = respond(Err(BridgeError::NotFound("x".into())));
        assert!(body.0.get("permissionError").is_none());
    }
}
