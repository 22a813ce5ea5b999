//! Routes gateway dispatches into the control plane.
//!
//! Consumes [`WireEvent`]s from the session and calls down into the
//! registry, the interaction manager, and the IDE delivery seam. Holds
//! no back-pointers into the session; the only shared state is the
//! per-thread cell block.

use crate::gateway::{ChatPort, ThreadCells, WireEvent};
use crate::ide::ConversationDelivery;
use crate::interaction::InteractionManager;
use crate::registry::MappingRegistry;
use crate::error::Result;
use crate::{ThreadId, now_ms};

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Reaction confirming a message reached the IDE.
const DELIVERED_EMOJI: &str = "✅";

/// Buffer subtracted from the auto-archive duration when deciding
/// whether an archive transition was manual.
const ARCHIVE_DETECT_BUFFER_MS: i64 = 5 * 60 * 1000;

/// Manual vs. inactivity archive classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Archived well before the auto-archive deadline: a person did it.
    Manual,
    /// Archived at (or past, or with no recorded activity) the
    /// deadline: the chat service's inactivity timer did it.
    Inactivity,
}

/// Classify an archive transition from the thread's auto-archive
/// duration (as observed on the event itself) and the time since the
/// last local activity.
pub fn archive_kind(since_activity_ms: Option<i64>, auto_archive_minutes: i64) -> ArchiveKind {
    let threshold_ms = auto_archive_minutes * 60_000 - ARCHIVE_DETECT_BUFFER_MS;
    match since_activity_ms {
        Some(since) if since <= threshold_ms => ArchiveKind::Manual,
        _ => ArchiveKind::Inactivity,
    }
}

pub struct EventRouter {
    chat: Arc<dyn ChatPort>,
    registry: Arc<MappingRegistry>,
    interactions: Arc<InteractionManager>,
    delivery: Arc<dyn ConversationDelivery>,
    cells: Arc<ThreadCells>,
    connected: Arc<AtomicBool>,
    bot_user_id: std::sync::Mutex<Option<String>>,
}

impl EventRouter {
    pub fn new(
        chat: Arc<dyn ChatPort>,
        registry: Arc<MappingRegistry>,
        interactions: Arc<InteractionManager>,
        delivery: Arc<dyn ConversationDelivery>,
        cells: Arc<ThreadCells>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chat,
            registry,
            interactions,
            delivery,
            cells,
            connected,
            bot_user_id: std::sync::Mutex::new(None),
        }
    }

    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<WireEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(error) = self.handle(event).await {
                tracing::warn!(%error, "event routing failed");
            }
        }
    }

    pub async fn handle(&self, event: WireEvent) -> Result<()> {
        match event {
            WireEvent::Ready { bot_user_id, .. } => {
                *self.bot_user_id.lock().expect("bot user lock") = Some(bot_user_id);
                self.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            WireEvent::Disconnected { reason } => {
                tracing::warn!(reason, "gateway disconnected");
                self.connected.store(false, Ordering::Relaxed);
                Ok(())
            }
            WireEvent::Dispatch { name, payload } => match name.as_str() {
                "MESSAGE_CREATE" => self.handle_message(payload).await,
                "THREAD_UPDATE" => self.handle_thread_update(payload).await,
                "INTERACTION_CREATE" => self.handle_interaction(payload).await,
                _ => Ok(()),
            },
        }
    }

    /// Inbound thread message: update activity, clear an explicit
    /// archive, resolve an open question, or forward to the IDE.
    async fn handle_message(&self, payload: Value) -> Result<()> {
        let author_id = payload["author"]["id"].as_str().unwrap_or_default().to_owned();
        let author_is_bot = payload["author"]["bot"].as_bool().unwrap_or(false);
        let own_id = self.bot_user_id.lock().expect("bot user lock").clone();
        if author_is_bot || Some(author_id.as_str()) == own_id.as_deref() {
            return Ok(());
        }

        // In a thread, the message's channel id is the thread id.
        let thread_id = ThreadId(payload["channel_id"].as_str().unwrap_or_default().to_owned());
        let Some(mapping) = self.registry.get_by_thread(&thread_id)? else {
            return Ok(());
        };

        let now = now_ms();
        self.registry.record_activity(&thread_id, now)?;
        if self.registry.is_explicitly_archived(&thread_id)? {
            self.registry.clear_explicitly_archived(&thread_id)?;
            tracing::debug!(thread_id = %thread_id, "explicit archive cleared by new message");
        }

        let content = payload["content"].as_str().unwrap_or_default();
        if self.interactions.try_resolve_text(&thread_id, content).await {
            return Ok(());
        }

        self.cells.record_speaker(&thread_id, author_id, now).await;

        let message_id = crate::MessageId(payload["id"].as_str().unwrap_or_default().to_owned());
        match self
            .delivery
            .deliver(&mapping.conversation_id, content, Some(&thread_id))
            .await
        {
            Ok(()) => {
                self.chat
                    .react(&thread_id, &message_id, DELIVERED_EMOJI)
                    .await
                    .ok();
            }
            Err(error) => {
                tracing::warn!(%error, thread_id = %thread_id, "IDE delivery failed");
                self.chat
                    .reply_to_message(
                        &thread_id,
                        &message_id,
                        &format!("⚠️ Could not deliver this message to the IDE: {error}"),
                    )
                    .await
                    .ok();
            }
        }
        Ok(())
    }

    /// Archive-state transitions: off→on is classified manual vs.
    /// inactivity; on→off clears the explicit flag.
    async fn handle_thread_update(&self, payload: Value) -> Result<()> {
        let thread_id = ThreadId(payload["id"].as_str().unwrap_or_default().to_owned());
        if self.registry.get_by_thread(&thread_id)?.is_none() {
            return Ok(());
        }

        let metadata = &payload["thread_metadata"];
        let archived = metadata["archived"].as_bool().unwrap_or(false);
        let auto_archive_minutes = metadata["auto_archive_duration"].as_i64().unwrap_or(10_080);

        let previous = self.cells.swap_archived(&thread_id, archived).await;

        if archived && previous != Some(true) {
            let since = self
                .registry
                .activity_of(&thread_id)?
                .map(|last| now_ms() - last);
            match archive_kind(since, auto_archive_minutes) {
                ArchiveKind::Manual => {
                    self.registry.set_explicitly_archived(&thread_id)?;
                    tracing::info!(thread_id = %thread_id, "thread archived by user");
                }
                ArchiveKind::Inactivity => {
                    tracing::info!(thread_id = %thread_id, "thread archived by inactivity");
                }
            }
        } else if !archived && previous == Some(true) {
            self.registry.clear_explicitly_archived(&thread_id)?;
            tracing::debug!(thread_id = %thread_id, "thread unarchived");
        }
        Ok(())
    }

    async fn handle_interaction(&self, payload: Value) -> Result<()> {
        // Only message-component interactions (type 3) carry buttons.
        if payload["type"].as_i64() != Some(3) {
            return Ok(());
        }
        let custom_id = payload["data"]["custom_id"].as_str().unwrap_or_default();
        let interaction_id = payload["id"].as_str().unwrap_or_default();
        let token = payload["token"].as_str().unwrap_or_default();
        self.interactions
            .handle_button(custom_id, interaction_id, token)
            .await
    }
}
