//! Chat gateway: the Discord-facing half of the bridge.
//!
//! The control plane talks to the chat service exclusively through the
//! [`ChatPort`] trait so watchers, the resolver, and the RPC surface can
//! run against an in-memory gateway in tests. [`client::DiscordGateway`]
//! is the production implementation (REST + gateway websocket).

pub mod client;
pub mod format;
pub mod protocol;
pub mod rest;
pub mod router;
pub mod session;

pub use client::DiscordGateway;
pub use router::EventRouter;

use crate::{ConversationId, MessageId, Result, ThreadId};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// File content for an upload: a local path or raw bytes.
#[derive(Debug, Clone)]
pub enum FilePayload {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// Operations the control plane needs from the chat service.
///
/// Every thread-addressed call takes an explicit [`ThreadId`]; there is no
/// "current thread" fallback anywhere on this seam.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Create a public thread for a conversation, persist the mapping,
    /// post the welcome message, and invite configured users. Refuses an
    /// empty name.
    async fn create_thread(
        &self,
        conversation_id: &ConversationId,
        name: &str,
    ) -> Result<ThreadId>;

    /// Post agent output into a thread, split into ≤2000-code-point
    /// chunks. Only the first chunk carries the optional ping prefix.
    async fn post_to_thread(&self, thread_id: &ThreadId, text: &str, as_embed: bool)
    -> Result<()>;

    /// Post a single unsplit message and return its id (used for
    /// interactive prompts that are edited in place).
    async fn post_plain(&self, thread_id: &ThreadId, text: &str) -> Result<MessageId>;

    /// Edit a message's content and (optionally) its component rows.
    async fn edit_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        content: &str,
        components: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Reply to a specific message in a thread.
    async fn reply_to_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<()>;

    /// React to a message with a unicode emoji.
    async fn react(&self, thread_id: &ThreadId, message_id: &MessageId, emoji: &str)
    -> Result<()>;

    async fn send_file(
        &self,
        thread_id: &ThreadId,
        file: FilePayload,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<()>;

    /// No-op when the thread already bears `name`; truncates to 100 code
    /// points before the wire call.
    async fn rename_thread(&self, thread_id: &ThreadId, name: &str) -> Result<()>;

    /// Fetch the thread's current name. `NotFound` marks the mapping
    /// stale on the caller's side.
    async fn thread_name(&self, thread_id: &ThreadId) -> Result<String>;

    async fn archive_thread(&self, thread_id: &ThreadId) -> Result<()>;

    async fn unarchive_thread(&self, thread_id: &ThreadId) -> Result<()>;

    /// Tri-state: `None` when the thread cannot be inspected.
    async fn is_thread_archived(&self, thread_id: &ThreadId) -> Result<Option<bool>>;

    /// Start the typing indicator: refresh every 8 s, hard stop at 5 min.
    async fn start_typing(&self, thread_id: &ThreadId) -> Result<()>;

    /// Idempotent; a stop with no active indicator succeeds.
    async fn stop_typing(&self, thread_id: &ThreadId) -> Result<()>;

    /// Acknowledge or answer a component interaction.
    async fn respond_interaction(
        &self,
        interaction_id: &str,
        token: &str,
        response: serde_json::Value,
    ) -> Result<()>;
}

/// Wire-level events relayed from the gateway session to the router.
#[derive(Debug, Clone)]
pub enum WireEvent {
    Ready {
        bot_user_id: String,
        session_id: String,
    },
    Dispatch {
        name: String,
        payload: serde_json::Value,
    },
    Disconnected {
        reason: String,
    },
}

/// A user who recently wrote in a thread; consumed once by the next
/// agent post to decide ping behavior under `on_recent_user_message`.
#[derive(Debug, Clone)]
pub struct RecentSpeaker {
    pub user_id: String,
    pub at_ms: i64,
}

/// Process-scoped per-thread cells shared between the outbound client
/// and the inbound event router.
#[derive(Default)]
pub struct ThreadCells {
    /// Thread → who last spoke there (ping decisions).
    pub recent_speakers: Mutex<HashMap<ThreadId, RecentSpeaker>>,
    /// Thread → last observed archived flag (transition detection).
    pub archived: Mutex<HashMap<ThreadId, bool>>,
}

impl ThreadCells {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the recent-speaker record for a thread, if any.
    pub async fn take_recent_speaker(&self, thread_id: &ThreadId) -> Option<RecentSpeaker> {
        self.recent_speakers.lock().await.remove(thread_id)
    }

    pub async fn record_speaker(&self, thread_id: &ThreadId, user_id: String, at_ms: i64) {
        self.recent_speakers
            .lock()
            .await
            .insert(thread_id.clone(), RecentSpeaker { user_id, at_ms });
    }

    /// Record the new archived flag and return the previous one.
    pub async fn swap_archived(&self, thread_id: &ThreadId, archived: bool) -> Option<bool> {
        self.archived.lock().await.insert(thread_id.clone(), archived)
    }
}
