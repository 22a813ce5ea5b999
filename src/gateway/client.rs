//! `DiscordGateway`: the production [`ChatPort`] over the Discord REST
//! API, plus the per-thread typing cells.

use crate::config::{MessagePingMode, RuntimeConfig, ThreadCreationNotify};
use crate::error::{BridgeError, Result};
use crate::gateway::format::{assemble_chunks, ping_prefix, truncate_name};
use crate::gateway::rest::DiscordRest;
use crate::gateway::{ChatPort, FilePayload, ThreadCells};
use crate::registry::MappingRegistry;
use crate::{ConversationId, Mapping, MessageId, ThreadId, now_ms};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Typing indicator refresh cadence.
const TYPING_REFRESH: Duration = Duration::from_secs(8);
/// Hard cap after which a typing indicator self-cancels.
const TYPING_MAX: Duration = Duration::from_secs(5 * 60);

pub struct DiscordGateway {
    rest: Arc<DiscordRest>,
    registry: Arc<MappingRegistry>,
    config: Arc<ArcSwap<RuntimeConfig>>,
    cells: Arc<ThreadCells>,
    typing: Arc<Mutex<HashMap<ThreadId, JoinHandle<()>>>>,
    workspace: String,
}

impl DiscordGateway {
    pub fn new(
        rest: Arc<DiscordRest>,
        registry: Arc<MappingRegistry>,
        config: Arc<ArcSwap<RuntimeConfig>>,
        cells: Arc<ThreadCells>,
        workspace: String,
    ) -> Self {
        Self {
            rest,
            registry,
            config,
            cells,
            typing: Arc::new(Mutex::new(HashMap::new())),
            workspace,
        }
    }

    pub fn rest(&self) -> &Arc<DiscordRest> {
        &self.rest
    }

    /// Abort every typing refresh task (shutdown path).
    pub async fn clear_typing(&self) {
        let mut typing = self.typing.lock().await;
        for (_, handle) in typing.drain() {
            handle.abort();
        }
    }

    /// Point thread creation at a channel; persists the project config
    /// and publishes the new snapshot to running components.
    pub fn select_channel(&self, channel_id: &str, channel_name: Option<&str>) -> Result<()> {
        let mut project = self.config.load().project.clone();
        project.channel_id = Some(channel_id.to_owned());
        project.channel_name = channel_name.map(str::to_owned);
        if project.created_at.is_none() {
            project.created_at = Some(now_ms());
        }
        self.registry.store_project_config(&project)?;

        let global = self.config.load().global.clone();
        self.config.store(Arc::new(crate::config::RuntimeConfig { global, project }));
        tracing::info!(channel_id, "project channel selected");
        Ok(())
    }

    fn configured_channel(&self) -> Result<String> {
        self.config
            .load()
            .project
            .channel_id
            .clone()
            .ok_or_else(|| BridgeError::NotFound("no project channel configured".into()))
    }
}

fn value_id(value: &Value) -> Result<String> {
    value["id"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| BridgeError::Gateway("response missing id".into()))
}

#[async_trait]
impl ChatPort for DiscordGateway {
    async fn create_thread(
        &self,
        conversation_id: &ConversationId,
        name: &str,
    ) -> Result<ThreadId> {
        if name.trim().is_empty() {
            return Err(BridgeError::MissingParameter("name"));
        }
        let channel = self.configured_channel()?;
        let config = self.config.load();

        let created = self.rest.create_thread(&channel, &truncate_name(name)).await?;
        let thread_id = ThreadId(value_id(&created)?);
        let now = now_ms();

        self.registry.insert_mapping(&Mapping {
            conversation_id: conversation_id.clone(),
            thread_id: thread_id.clone(),
            workspace: self.workspace.clone(),
            created_at: now,
            claimed_at: None,
        })?;
        self.registry.record_activity(&thread_id, now)?;

        let welcome = format!(
            "Mirroring IDE conversation **{name}** from workspace `{}`. Messages posted here are delivered to the agent.",
            self.workspace
        );
        self.rest
            .create_message(thread_id.as_str(), json!({ "content": welcome }))
            .await?;

        for user_id in &config.global.invite_user_ids {
            if let Err(error) = self.rest.add_thread_member(thread_id.as_str(), user_id).await {
                tracing::warn!(%error, user_id, "failed to invite user to thread");
            }
        }

        if config.global.thread_creation_notify == ThreadCreationNotify::Ping
            && !config.global.invite_user_ids.is_empty()
        {
            let mentions: Vec<String> = config
                .global
                .invite_user_ids
                .iter()
                .map(|id| format!("<@{id}>"))
                .collect();
            self.rest
                .create_message(
                    thread_id.as_str(),
                    json!({ "content": format!("{} new conversation thread", mentions.join(" ")) }),
                )
                .await
                .ok();
        }

        tracing::info!(
            conversation_id = %conversation_id,
            thread_id = %thread_id,
            name,
            "thread created"
        );
        Ok(thread_id)
    }

    async fn post_to_thread(
        &self,
        thread_id: &ThreadId,
        text: &str,
        as_embed: bool,
    ) -> Result<()> {
        let config = self.config.load();

        let recent = {
            let speakers = self.cells.recent_speakers.lock().await;
            speakers.get(thread_id).map(|speaker| speaker.user_id.clone())
        };
        let prefix = ping_prefix(
            config.global.message_ping_mode,
            &config.global.invite_user_ids,
            recent.as_deref(),
        );

        for chunk in assemble_chunks(text, prefix.as_deref()) {
            let body = if as_embed {
                json!({ "embeds": [{ "description": chunk }] })
            } else {
                json!({ "content": chunk })
            };
            self.rest.create_message(thread_id.as_str(), body).await?;
        }

        // The recent-speaker record is consumed once the post lands,
        // and only when this mode actually used it.
        if config.global.message_ping_mode == MessagePingMode::OnRecentUserMessage
            && recent.is_some()
        {
            self.cells.take_recent_speaker(thread_id).await;
        }
        self.registry.record_activity(thread_id, now_ms())?;
        Ok(())
    }

    async fn post_plain(&self, thread_id: &ThreadId, text: &str) -> Result<MessageId> {
        let created = self
            .rest
            .create_message(thread_id.as_str(), json!({ "content": text }))
            .await?;
        self.registry.record_activity(thread_id, now_ms())?;
        Ok(MessageId(value_id(&created)?))
    }

    async fn edit_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        content: &str,
        components: Option<Value>,
    ) -> Result<()> {
        let mut body = json!({ "content": content });
        if let Some(components) = components {
            body["components"] = components;
        }
        self.rest
            .edit_message(thread_id.as_str(), message_id.as_str(), body)
            .await?;
        Ok(())
    }

    async fn reply_to_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<()> {
        self.rest
            .create_message(
                thread_id.as_str(),
                json!({
                    "content": text,
                    "message_reference": { "message_id": message_id.as_str() },
                }),
            )
            .await?;
        Ok(())
    }

    async fn react(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.rest
            .create_reaction(thread_id.as_str(), message_id.as_str(), emoji)
            .await
    }

    async fn send_file(
        &self,
        thread_id: &ThreadId,
        file: FilePayload,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        let (bytes, default_name) = match file {
            FilePayload::Bytes(bytes) => (bytes, None),
            FilePayload::Path(path) => {
                if !path.exists() {
                    // Never dereference a path that does not exist locally;
                    // remote peers must send base64 instead.
                    return Err(BridgeError::NotFound(format!(
                        "file {} does not exist on this host",
                        path.display()
                    )));
                }
                let bytes = tokio::fs::read(&path).await?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
                (bytes, file_name)
            }
        };
        let file_name = name
            .map(str::to_owned)
            .or(default_name)
            .unwrap_or_else(|| "attachment.bin".to_owned());

        self.rest
            .upload_file(thread_id.as_str(), &file_name, bytes, description)
            .await?;
        self.registry.record_activity(thread_id, now_ms())?;
        Ok(())
    }

    async fn rename_thread(&self, thread_id: &ThreadId, name: &str) -> Result<()> {
        let truncated = truncate_name(name);
        let current = self.rest.get_channel(thread_id.as_str()).await?;
        if current["name"].as_str() == Some(truncated.as_str()) {
            return Ok(());
        }
        self.rest
            .rename_channel(thread_id.as_str(), &truncated)
            .await?;
        tracing::info!(thread_id = %thread_id, name = %truncated, "thread renamed");
        Ok(())
    }

    async fn thread_name(&self, thread_id: &ThreadId) -> Result<String> {
        let channel = self.rest.get_channel(thread_id.as_str()).await?;
        channel["name"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| BridgeError::Gateway("channel without name".into()))
    }

    async fn archive_thread(&self, thread_id: &ThreadId) -> Result<()> {
        self.rest
            .set_thread_archived(thread_id.as_str(), true)
            .await?;
        Ok(())
    }

    async fn unarchive_thread(&self, thread_id: &ThreadId) -> Result<()> {
        self.rest
            .set_thread_archived(thread_id.as_str(), false)
            .await?;
        Ok(())
    }

    async fn is_thread_archived(&self, thread_id: &ThreadId) -> Result<Option<bool>> {
        match self.rest.get_channel(thread_id.as_str()).await {
            Ok(channel) => Ok(channel["thread_metadata"]["archived"].as_bool()),
            Err(BridgeError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn start_typing(&self, thread_id: &ThreadId) -> Result<()> {
        let mut typing = self.typing.lock().await;
        if let Some(existing) = typing.get(thread_id)
            && !existing.is_finished()
        {
            return Ok(());
        }

        let rest = Arc::clone(&self.rest);
        let channel = thread_id.as_str().to_owned();
        let handle = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + TYPING_MAX;
            loop {
                if let Err(error) = rest.trigger_typing(&channel).await {
                    tracing::debug!(%error, channel, "typing refresh failed");
                    break;
                }
                if tokio::time::Instant::now() + TYPING_REFRESH >= deadline {
                    break;
                }
                tokio::time::sleep(TYPING_REFRESH).await;
            }
        });
        typing.insert(thread_id.clone(), handle);
        Ok(())
    }

    async fn stop_typing(&self, thread_id: &ThreadId) -> Result<()> {
        if let Some(handle) = self.typing.lock().await.remove(thread_id) {
            handle.abort();
        }
        Ok(())
    }

    async fn respond_interaction(
        &self,
        interaction_id: &str,
        token: &str,
        response: Value,
    ) -> Result<()> {
        self.rest
            .create_interaction_response(interaction_id, token, response)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_id_extraction() {
        assert_eq!(value_id(&json!({"id": "42"})).unwrap(), "42");
        assert!(value_id(&json!({"name": "x"})).is_err());
        assert!(value_id(&json!({"id": 42})).is_err());
    }
}
