//! Discord REST API client.
//!
//! A thin path-per-method wrapper over `reqwest`. Status codes map onto
//! the bridge's error kinds: 401/403 → permission, 404 → not found,
//! 429 → one retry after `retry_after`, then throttled.

use crate::error::{BridgeError, Result};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

const API_BASE: &str = "https://discord.com/api/v10";

/// Public thread channel type.
const CHANNEL_TYPE_PUBLIC_THREAD: u8 = 11;
/// Guild text channel type.
const CHANNEL_TYPE_GUILD_TEXT: u8 = 0;
/// Guild category type.
const CHANNEL_TYPE_CATEGORY: u8 = 4;

/// 7-day auto-archive, in minutes.
pub const THREAD_AUTO_ARCHIVE_MINUTES: u32 = 10_080;

/// Permission bits the bot needs in the configured guild.
pub mod permission {
    pub const ADMINISTRATOR: u64 = 1 << 3;
    pub const MANAGE_CHANNELS: u64 = 1 << 4;
    pub const ADD_REACTIONS: u64 = 1 << 6;
    pub const VIEW_CHANNEL: u64 = 1 << 10;
    pub const SEND_MESSAGES: u64 = 1 << 11;
    pub const READ_MESSAGE_HISTORY: u64 = 1 << 16;
    pub const CREATE_PUBLIC_THREADS: u64 = 1 << 34;
    pub const SEND_MESSAGES_IN_THREADS: u64 = 1 << 38;

    pub const REQUIRED: &[(&str, u64)] = &[
        ("Send Messages", SEND_MESSAGES),
        ("Create Public Threads", CREATE_PUBLIC_THREADS),
        ("Send Messages in Threads", SEND_MESSAGES_IN_THREADS),
        ("Manage Channels", MANAGE_CHANNELS),
        ("View Channels", VIEW_CHANNEL),
        ("Read Message History", READ_MESSAGE_HISTORY),
        ("Add Reactions", ADD_REACTIONS),
    ];
}

/// Outcome of a guild permission check.
#[derive(Debug, Clone)]
pub struct PermissionCheck {
    pub ok: bool,
    pub missing: Vec<String>,
}

pub struct DiscordRest {
    http: reqwest::Client,
    token: String,
}

impl DiscordRest {
    pub fn new(token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let mut attempted_retry = false;
        loop {
            let mut builder = self
                .http
                .request(method.clone(), format!("{API_BASE}{path}"))
                .header("Authorization", format!("Bot {}", self.token));
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let response = builder.send().await?;
            let status = response.status();

            if status.as_u16() == 429 && !attempted_retry {
                let retry_after = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("retry_after").and_then(Value::as_f64))
                    .unwrap_or(1.0);
                tracing::debug!(path, retry_after, "rate limited, retrying once");
                tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                attempted_retry = true;
                continue;
            }

            return match status.as_u16() {
                200..=299 => {
                    let text = response.text().await?;
                    if text.is_empty() {
                        Ok(Value::Null)
                    } else {
                        Ok(serde_json::from_str(&text)?)
                    }
                }
                401 | 403 => {
                    let detail = response.text().await.unwrap_or_default();
                    Err(BridgeError::PermissionDenied(format!("{status}: {detail}")))
                }
                404 => Err(BridgeError::NotFound(path.to_owned())),
                429 => Err(BridgeError::Throttled),
                _ => {
                    let detail = response.text().await.unwrap_or_default();
                    Err(BridgeError::Gateway(format!(
                        "Discord API error {status} on {path}: {detail}"
                    )))
                }
            };
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.request(reqwest::Method::GET, path, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(reqwest::Method::POST, path, Some(&body)).await
    }

    async fn patch(&self, path: &str, body: Value) -> Result<Value> {
        self.request(reqwest::Method::PATCH, path, Some(&body)).await
    }

    async fn put(&self, path: &str) -> Result<Value> {
        self.request(reqwest::Method::PUT, path, None).await
    }

    // ── Identity ────────────────────────────────────────────────────

    pub async fn current_user(&self) -> Result<Value> {
        self.get("/users/@me").await
    }

    pub async fn gateway_url(&self) -> Result<String> {
        let body: super::protocol::GatewayBot = self.get("/gateway/bot").await?;
        Ok(body.url)
    }

    // ── Guilds and channels ─────────────────────────────────────────

    pub async fn list_guilds(&self) -> Result<Vec<Value>> {
        self.get("/users/@me/guilds").await
    }

    pub async fn list_channels(&self, guild_id: &str) -> Result<Vec<Value>> {
        let channels: Vec<Value> = self.get(&format!("/guilds/{guild_id}/channels")).await?;
        Ok(channels
            .into_iter()
            .filter(|channel| channel["type"].as_u64() == Some(u64::from(CHANNEL_TYPE_GUILD_TEXT)))
            .collect())
    }

    pub async fn list_categories(&self, guild_id: &str) -> Result<Vec<Value>> {
        let channels: Vec<Value> = self.get(&format!("/guilds/{guild_id}/channels")).await?;
        Ok(channels
            .into_iter()
            .filter(|channel| {
                channel["type"].as_u64() == Some(u64::from(CHANNEL_TYPE_CATEGORY))
            })
            .collect())
    }

    pub async fn create_channel(
        &self,
        guild_id: &str,
        name: &str,
        category_id: Option<&str>,
    ) -> Result<Value> {
        let mut body = json!({
            "name": super::format::sanitize_channel_name(name),
            "type": CHANNEL_TYPE_GUILD_TEXT,
        });
        if let Some(parent) = category_id {
            body["parent_id"] = Value::from(parent);
        }
        self.post(&format!("/guilds/{guild_id}/channels"), body).await
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Value> {
        self.get(&format!("/channels/{channel_id}")).await
    }

    /// Compute the bot's effective guild-level permissions from its
    /// roles and report which required capabilities are missing.
    pub async fn check_permissions(&self, guild_id: &str) -> Result<PermissionCheck> {
        let member: Value = self.get(&format!("/guilds/{guild_id}/members/@me")).await?;
        let roles: Vec<Value> = self.get(&format!("/guilds/{guild_id}/roles")).await?;

        let member_roles: Vec<&str> = member["roles"]
            .as_array()
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut granted: u64 = 0;
        for role in &roles {
            let role_id = role["id"].as_str().unwrap_or_default();
            // @everyone shares the guild's id and applies to every member.
            if role_id == guild_id || member_roles.contains(&role_id) {
                granted |= role["permissions"]
                    .as_str()
                    .and_then(|bits| bits.parse::<u64>().ok())
                    .unwrap_or(0);
            }
        }

        Ok(evaluate_permissions(granted))
    }

    // ── Threads ─────────────────────────────────────────────────────

    pub async fn create_thread(&self, channel_id: &str, name: &str) -> Result<Value> {
        self.post(
            &format!("/channels/{channel_id}/threads"),
            json!({
                "name": name,
                "type": CHANNEL_TYPE_PUBLIC_THREAD,
                "auto_archive_duration": THREAD_AUTO_ARCHIVE_MINUTES,
            }),
        )
        .await
    }

    pub async fn set_thread_archived(&self, thread_id: &str, archived: bool) -> Result<Value> {
        self.patch(&format!("/channels/{thread_id}"), json!({ "archived": archived }))
            .await
    }

    pub async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<Value> {
        self.patch(&format!("/channels/{channel_id}"), json!({ "name": name }))
            .await
    }

    pub async fn add_thread_member(&self, thread_id: &str, user_id: &str) -> Result<()> {
        self.put(&format!("/channels/{thread_id}/thread-members/{user_id}"))
            .await?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    pub async fn create_message(&self, channel_id: &str, body: Value) -> Result<Value> {
        self.post(&format!("/channels/{channel_id}/messages"), body).await
    }

    pub async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        body: Value,
    ) -> Result<Value> {
        self.patch(&format!("/channels/{channel_id}/messages/{message_id}"), body)
            .await
    }

    pub async fn create_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let encoded: String = emoji
            .bytes()
            .flat_map(|b| format!("%{b:02X}").into_bytes())
            .map(char::from)
            .collect();
        self.put(&format!(
            "/channels/{channel_id}/messages/{message_id}/reactions/{encoded}/@me"
        ))
        .await?;
        Ok(())
    }

    pub async fn trigger_typing(&self, channel_id: &str) -> Result<()> {
        self.post(&format!("/channels/{channel_id}/typing"), json!({})).await?;
        Ok(())
    }

    pub async fn upload_file(
        &self,
        channel_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
        description: Option<&str>,
    ) -> Result<Value> {
        let mut attachment = json!({ "id": 0, "filename": file_name });
        if let Some(description) = description {
            attachment["description"] = Value::from(description);
        }
        let payload = json!({ "attachments": [attachment] });

        let form = reqwest::multipart::Form::new()
            .text("payload_json", payload.to_string())
            .part(
                "files[0]",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_owned()),
            );

        let response = self
            .http
            .post(format!("{API_BASE}/channels/{channel_id}/messages"))
            .header("Authorization", format!("Bot {}", self.token))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(response.json().await?),
            401 | 403 => Err(BridgeError::PermissionDenied(status.to_string())),
            404 => Err(BridgeError::NotFound(format!("channel {channel_id}"))),
            429 => Err(BridgeError::Throttled),
            _ => Err(BridgeError::Gateway(format!("file upload failed: {status}"))),
        }
    }

    // ── Interactions ────────────────────────────────────────────────

    pub async fn create_interaction_response(
        &self,
        interaction_id: &str,
        token: &str,
        response: Value,
    ) -> Result<()> {
        self.post(
            &format!("/interactions/{interaction_id}/{token}/callback"),
            response,
        )
        .await?;
        Ok(())
    }
}

/// Split a granted permission bitmask into a pass/fail verdict.
pub fn evaluate_permissions(granted: u64) -> PermissionCheck {
    if granted & permission::ADMINISTRATOR != 0 {
        return PermissionCheck {
            ok: true,
            missing: Vec::new(),
        };
    }
    let missing: Vec<String> = permission::REQUIRED
        .iter()
        .filter(|(_, bit)| granted & bit == 0)
        .map(|(name, _)| (*name).to_owned())
        .collect();
    PermissionCheck {
        ok: missing.is_empty(),
        missing,
    }
}
