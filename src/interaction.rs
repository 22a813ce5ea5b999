//! Interactive questions: post a prompt with option buttons, then
//! await a single resolution (button, free-text reply, or timeout).
//!
//! Open questions are keyed by the prompt message's own id, which is
//! also embedded in every button custom id so interaction events route
//! back without any other lookup. A question resolves exactly once: the
//! registry entry (sink and timer together) is removed under the lock
//! before the sink fires.

use crate::gateway::ChatPort;
use crate::error::Result;
use crate::{MessageId, ThreadId};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

/// Custom-id namespace for question buttons.
const CUSTOM_ID_PREFIX: &str = "q";
/// Custom-id suffix of the multi-select submit button.
const SUBMIT_SUFFIX: &str = "submit";
/// Discord caps an action row at five buttons.
const BUTTONS_PER_ROW: usize = 5;

pub const DEFAULT_QUESTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub label: String,
}

/// How a question resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionReply {
    /// One or more option ids were selected.
    Options(Vec<String>),
    /// A plain-text reply arrived in the thread.
    Text(String),
    TimedOut,
}

struct OpenQuestion {
    thread_id: ThreadId,
    question: String,
    options: Vec<QuestionOption>,
    allow_multiple: bool,
    selected: BTreeSet<String>,
    sink: oneshot::Sender<QuestionReply>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

pub struct InteractionManager {
    chat: Arc<dyn ChatPort>,
    open: Mutex<HashMap<MessageId, OpenQuestion>>,
}

impl InteractionManager {
    pub fn new(chat: Arc<dyn ChatPort>) -> Self {
        Self {
            chat,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Post a question and block until it resolves.
    pub async fn ask(
        self: &Arc<Self>,
        thread_id: &ThreadId,
        question: &str,
        options: Vec<QuestionOption>,
        allow_multiple: bool,
        timeout: Option<Duration>,
    ) -> Result<QuestionReply> {
        let message_id = self.chat.post_plain(thread_id, "…").await?;

        let (content, components) =
            render_open(question, &options, &message_id, allow_multiple, &BTreeSet::new());
        self.chat
            .edit_message(thread_id, &message_id, &content, Some(components))
            .await?;

        let (sink, resolution) = oneshot::channel();
        {
            let mut open = self.open.lock().await;
            open.insert(
                message_id.clone(),
                OpenQuestion {
                    thread_id: thread_id.clone(),
                    question: question.to_owned(),
                    options,
                    allow_multiple,
                    selected: BTreeSet::new(),
                    sink,
                    timer: None,
                },
            );
        }

        let timer = tokio::spawn({
            let manager = Arc::clone(self);
            let message_id = message_id.clone();
            let timeout = timeout.unwrap_or(DEFAULT_QUESTION_TIMEOUT);
            async move {
                tokio::time::sleep(timeout).await;
                manager.expire(&message_id).await;
            }
        });
        if let Some(entry) = self.open.lock().await.get_mut(&message_id) {
            entry.timer = Some(timer);
        } else {
            // Resolved between insert and here; the timer has nothing to do.
            timer.abort();
        }

        tracing::info!(thread_id = %thread_id, message_id = %message_id, "question posted");

        Ok(resolution.await.unwrap_or(QuestionReply::TimedOut))
    }

    /// Route a button interaction whose custom id carries the question
    /// prefix. Unknown message ids get an ephemeral "expired" reply.
    pub async fn handle_button(
        &self,
        custom_id: &str,
        interaction_id: &str,
        token: &str,
    ) -> Result<()> {
        let Some((message_id, option_id)) = parse_custom_id(custom_id) else {
            return Ok(());
        };

        let mut open = self.open.lock().await;
        let Some(entry) = open.get_mut(&message_id) else {
            drop(open);
            self.chat
                .respond_interaction(
                    interaction_id,
                    token,
                    json!({
                        "type": 4,
                        "data": { "content": "This prompt has expired.", "flags": 64 },
                    }),
                )
                .await?;
            return Ok(());
        };

        // Acknowledge with a deferred update; the re-render follows as a
        // plain message edit.
        self.chat
            .respond_interaction(interaction_id, token, json!({ "type": 6 }))
            .await
            .ok();

        if entry.allow_multiple && option_id != SUBMIT_SUFFIX {
            // Toggle and refresh the form.
            if !entry.selected.remove(&option_id) {
                entry.selected.insert(option_id);
            }
            let (content, components) = render_open(
                &entry.question,
                &entry.options,
                &message_id,
                true,
                &entry.selected,
            );
            let thread_id = entry.thread_id.clone();
            drop(open);
            self.chat
                .edit_message(&thread_id, &message_id, &content, Some(components))
                .await?;
            return Ok(());
        }

        if entry.allow_multiple && entry.selected.is_empty() {
            // Submit with nothing selected; the button is disabled in the
            // UI, so just swallow the event.
            return Ok(());
        }

        let entry = open.remove(&message_id).expect("entry present under lock");
        drop(open);

        let selected: Vec<String> = if entry.allow_multiple {
            entry.selected.iter().cloned().collect()
        } else {
            vec![option_id]
        };

        if let Some(timer) = entry.timer {
            timer.abort();
        }
        let marks: BTreeSet<String> = selected.iter().cloned().collect();
        let content = render_answered(&entry.question, &entry.options, &marks);
        self.chat
            .edit_message(&entry.thread_id, &message_id, &content, Some(json!([])))
            .await
            .ok();

        let _ = entry.sink.send(QuestionReply::Options(selected));
        Ok(())
    }

    /// Resolve the open question on `thread_id` with a free-text reply.
    /// Returns true when a question consumed the message (it must not be
    /// forwarded to the IDE).
    pub async fn try_resolve_text(&self, thread_id: &ThreadId, text: &str) -> bool {
        let mut open = self.open.lock().await;
        let Some(message_id) = open
            .iter()
            .find(|(_, entry)| &entry.thread_id == thread_id)
            .map(|(message_id, _)| message_id.clone())
        else {
            return false;
        };
        let entry = open.remove(&message_id).expect("entry present under lock");
        drop(open);

        if let Some(timer) = entry.timer {
            timer.abort();
        }
        let content = render_answered(&entry.question, &entry.options, &entry.selected);
        self.chat
            .edit_message(&entry.thread_id, &message_id, &content, Some(json!([])))
            .await
            .ok();

        let _ = entry.sink.send(QuestionReply::Text(text.to_owned()));
        true
    }

    async fn expire(&self, message_id: &MessageId) {
        let entry = {
            let mut open = self.open.lock().await;
            open.remove(message_id)
        };
        let Some(entry) = entry else { return };

        tracing::info!(message_id = %message_id, "question timed out");
        let content = render_timed_out(&entry.question, &entry.options, &entry.selected);
        self.chat
            .edit_message(&entry.thread_id, message_id, &content, Some(json!([])))
            .await
            .ok();
        let _ = entry.sink.send(QuestionReply::TimedOut);
    }

    /// Whether a question is currently open on the given thread.
    pub async fn has_open_question(&self, thread_id: &ThreadId) -> bool {
        self.open
            .lock()
            .await
            .values()
            .any(|entry| &entry.thread_id == thread_id)
    }
}

/// `q:<prompt-message-id>:<option-id>` → (message id, option id).
fn parse_custom_id(custom_id: &str) -> Option<(MessageId, String)> {
    let mut parts = custom_id.splitn(3, ':');
    if parts.next()? != CUSTOM_ID_PREFIX {
        return None;
    }
    let message_id = parts.next()?;
    let option_id = parts.next()?;
    Some((MessageId(message_id.to_owned()), option_id.to_owned()))
}

fn button_custom_id(message_id: &MessageId, option_id: &str) -> String {
    format!("{CUSTOM_ID_PREFIX}:{message_id}:{option_id}")
}

/// The live form: question heading, option buttons, optional submit
/// row, and the free-text footer hint.
fn render_open(
    question: &str,
    options: &[QuestionOption],
    message_id: &MessageId,
    allow_multiple: bool,
    selected: &BTreeSet<String>,
) -> (String, Value) {
    let mut content = format!("**{question}**");
    if allow_multiple && !options.is_empty() {
        content.push_str("\n\nSelect one or more options, then press Submit.");
    }
    content.push_str("\n\n-# You can also just reply in this thread.");

    let mut rows: Vec<Value> = options
        .chunks(BUTTONS_PER_ROW)
        .map(|chunk| {
            let buttons: Vec<Value> = chunk
                .iter()
                .map(|option| {
                    let style = if selected.contains(&option.id) { 3 } else { 2 };
                    json!({
                        "type": 2,
                        "style": style,
                        "label": option.label,
                        "custom_id": button_custom_id(message_id, &option.id),
                    })
                })
                .collect();
            json!({ "type": 1, "components": buttons })
        })
        .collect();

    if allow_multiple && !options.is_empty() {
        rows.push(json!({
            "type": 1,
            "components": [{
                "type": 2,
                "style": 1,
                "label": "Submit",
                "custom_id": button_custom_id(message_id, SUBMIT_SUFFIX),
                "disabled": selected.is_empty(),
            }],
        }));
    }

    (content, Value::Array(rows))
}

/// The answered form: selected options marked, buttons removed.
fn render_answered(question: &str, options: &[QuestionOption], selected: &BTreeSet<String>) -> String {
    let mut content = format!("**{question}**\n");
    for option in options {
        let marker = if selected.contains(&option.id) { "✅" } else { "▫️" };
        content.push_str(&format!("\n{marker} {}", option.label));
    }
    content
}

fn render_timed_out(question: &str, options: &[QuestionOption], selected: &BTreeSet<String>) -> String {
    let mut content = render_answered(question, options, selected);
    content.push_str("\n\n-# Timed out.");
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Vec<QuestionOption> {
        vec![
            QuestionOption { id: "a".into(), label: "A".into() },
            QuestionOption { id: "b".into(), label: "B".into() },
            QuestionOption { id: "c".into(), label: "C".into() },
        ]
    }

    #[test]
    fn custom_id_roundtrip() {
        let message_id: MessageId = "123".into();
        let custom_id = button_custom_id(&message_id, "opt-1");
        assert_eq!(custom_id, "q:123:opt-1");
        let (back_message, back_option) = parse_custom_id(&custom_id).unwrap();
        assert_eq!(back_message, message_id);
        assert_eq!(back_option, "opt-1");
        assert!(parse_custom_id("other:123:x").is_none());
        assert!(parse_custom_id("q:123").is_none());
    }

    #[test]
    fn open_render_single_mode() {
        let (content, components) =
            render_open("Pick", &options(), &"m1".into(), false, &BTreeSet::new());
        assert!(content.starts_with("**Pick**"));
        assert!(content.contains("reply in this thread"));
        let rows = components.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        let buttons = rows[0]["components"].as_array().unwrap();
        assert_eq!(buttons.len(), 3);
        assert_eq!(buttons[0]["custom_id"], "q:m1:a");
        assert_eq!(buttons[0]["style"], 2);
    }

    #[test]
    fn open_render_multi_mode_submit_gating() {
        let (_, empty_selection) =
            render_open("Pick", &options(), &"m1".into(), true, &BTreeSet::new());
        let rows = empty_selection.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let submit = &rows[1]["components"][0];
        assert_eq!(submit["custom_id"], "q:m1:submit");
        assert_eq!(submit["disabled"], true);

        let mut selected = BTreeSet::new();
        selected.insert("b".to_owned());
        let (_, with_selection) = render_open("Pick", &options(), &"m1".into(), true, &selected);
        let rows = with_selection.as_array().unwrap();
        assert_eq!(rows[1]["components"][0]["disabled"], false);
        // The selected button flips to the success style.
        assert_eq!(rows[0]["components"][1]["style"], 3);
        assert_eq!(rows[0]["components"][0]["style"], 2);
    }

    #[test]
    fn many_options_wrap_rows() {
        let many: Vec<QuestionOption> = (0..7)
            .map(|i| QuestionOption { id: format!("o{i}"), label: format!("O{i}") })
            .collect();
        let (_, components) = render_open("Pick", &many, &"m1".into(), false, &BTreeSet::new());
        let rows = components.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["components"].as_array().unwrap().len(), 5);
        assert_eq!(rows[1]["components"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn answered_render_marks_selection() {
        let mut selected = BTreeSet::new();
        selected.insert("a".to_owned());
        selected.insert("b".to_owned());
        let content = render_answered("Pick", &options(), &selected);
        assert!(content.contains("✅ A"));
        assert!(content.contains("✅ B"));
        assert!(content.contains("▫️ C"));
    }

    #[test]
    fn timed_out_render_notes_expiry() {
        let content = render_timed_out("Pick", &options(), &BTreeSet::new());
        assert!(content.contains("Timed out"));
    }
}
