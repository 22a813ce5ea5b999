//! The interactive-question route: blocks until a button click, a text
//! reply, or the timeout.

use super::{ApiState, require_str, respond};
use crate::interaction::{QuestionOption, QuestionReply};
use crate::ThreadId;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub(super) async fn ask_question(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let result = async {
        let thread_id = ThreadId::from(require_str(&body, "threadId")?);
        let question = require_str(&body, "question")?;

        let options: Vec<QuestionOption> = body
            .get("options")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let allow_multiple = body
            .get("allowMultiple")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let timeout = body
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        let reply = state
            .interactions
            .ask(&thread_id, question, options, allow_multiple, timeout)
            .await?;

        Ok(match reply {
            QuestionReply::Options(selected) => json!({
                "success": true,
                "responseType": "option",
                "selectedOptionIds": selected,
            }),
            QuestionReply::Text(text) => json!({
                "success": true,
                "responseType": "text",
                "textResponse": text,
            }),
            QuestionReply::TimedOut => json!({
                "success": false,
                "error": "timed out",
            }),
        })
    }
    .await;
    respond(result)
}
