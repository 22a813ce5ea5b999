//! Per-host and per-workspace configuration records.
//!
//! Both records persist in the state store and are served to running
//! components through an [`arc_swap::ArcSwap`] so settings changes
//! propagate without restart.

use serde::{Deserialize, Serialize};

/// OAuth permission bitmask requested when inviting the bot.
pub const INVITE_PERMISSIONS: u64 = 397_284_550_672;

/// How thread creation is announced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadCreationNotify {
    #[default]
    Silent,
    Ping,
}

/// When agent posts mention configured users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePingMode {
    #[default]
    Never,
    OnRecentUserMessage,
    Always,
}

/// Per-host configuration: which guild, who to invite, ping policy, and
/// the implicit-archive knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub guild_id: Option<String>,
    pub guild_name: Option<String>,
    pub invite_user_ids: Vec<String>,
    pub thread_creation_notify: ThreadCreationNotify,
    pub message_ping_mode: MessagePingMode,
    /// Conversations within the top-N by recency stay open.
    pub implicit_archive_count: u32,
    /// Conversations touched within the last H hours stay open.
    pub implicit_archive_hours: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            guild_id: None,
            guild_name: None,
            invite_user_ids: Vec::new(),
            thread_creation_notify: ThreadCreationNotify::default(),
            message_ping_mode: MessagePingMode::default(),
            implicit_archive_count: 10,
            implicit_archive_hours: 48,
        }
    }
}

/// Per-workspace configuration: the channel threads are created in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub created_at: Option<i64>,
}

/// Snapshot handed to components via `ArcSwap<RuntimeConfig>`.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub global: GlobalConfig,
    pub project: ProjectConfig,
}

/// OAuth invite URL for the bot user.
pub fn invite_url(bot_user_id: &str) -> String {
    format!(
        "https://discord.com/oauth2/authorize?client_id={bot_user_id}&permissions={INVITE_PERMISSIONS}&scope=bot"
    )
}

/// Resolve the bot token: environment first, then the stored secret.
pub fn bot_token(stored: Option<String>) -> Option<String> {
    std::env::var("DISCORD_BOT_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .or(stored)
}
