//! Persistent workspace state: mappings, seen/archived sets, activity,
//! explicit-archive flags, and configuration records.
//!
//! Everything lives in a single redb database per workspace. Every
//! mutation is one write transaction, so readers never observe a
//! half-applied update. Expected scale is a few hundred mappings per
//! workspace; linear scans are fine.

use crate::config::{GlobalConfig, ProjectConfig};
use crate::error::{BridgeError, Result};
use crate::{ConversationId, Mapping, ThreadId};

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// conversation id → mapping JSON.
const MAPPINGS: TableDefinition<&str, &str> = TableDefinition::new("chat_mappings");
/// thread id → conversation id (reverse index).
const THREAD_INDEX: TableDefinition<&str, &str> = TableDefinition::new("thread_index");
/// Conversation ids ever observed by the chat watcher.
const SEEN: TableDefinition<&str, ()> = TableDefinition::new("all_time_seen_chat_ids");
/// Conversation ids whose archive has been mirrored to the chat side.
const ARCHIVED: TableDefinition<&str, ()> = TableDefinition::new("archived_chat_ids");
/// thread id → last local activity, epoch millis.
const ACTIVITY: TableDefinition<&str, i64> = TableDefinition::new("thread_last_activity");
/// Threads the user closed in the chat service.
const EXPLICIT_ARCHIVE: TableDefinition<&str, ()> =
    TableDefinition::new("explicitly_archived_thread_ids");
/// Misc records: project config, global config, bot token.
const CONFIG: TableDefinition<&str, &str> = TableDefinition::new("config");

const KEY_PROJECT_CONFIG: &str = "project_config";
const KEY_GLOBAL_CONFIG: &str = "global_config";
const KEY_BOT_TOKEN: &str = "bot_token";

pub struct MappingRegistry {
    db: Database,
}

impl MappingRegistry {
    /// Open (or create) the workspace state database and ensure all
    /// tables exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(MAPPINGS)?;
            txn.open_table(THREAD_INDEX)?;
            txn.open_table(SEEN)?;
            txn.open_table(ARCHIVED)?;
            txn.open_table(ACTIVITY)?;
            txn.open_table(EXPLICIT_ARCHIVE)?;
            txn.open_table(CONFIG)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    // ── Mappings ────────────────────────────────────────────────────

    /// Insert a mapping, maintaining the reverse index. A conversation
    /// re-mapped to a new thread drops its old index entry; a thread
    /// already bound to a different conversation is refused.
    pub fn insert_mapping(&self, mapping: &Mapping) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut threads = txn.open_table(THREAD_INDEX)?;
            let owner = threads
                .get(mapping.thread_id.as_str())?
                .map(|guard| guard.value().to_owned());
            if let Some(owner) = owner
                && owner != mapping.conversation_id.as_str()
            {
                return Err(BridgeError::InvariantViolation(format!(
                    "thread {} already mapped to conversation {owner}",
                    mapping.thread_id
                )));
            }

            let mut mappings = txn.open_table(MAPPINGS)?;
            let previous = mappings
                .get(mapping.conversation_id.as_str())?
                .map(|guard| guard.value().to_owned());
            if let Some(previous) = previous {
                let previous: Mapping = serde_json::from_str(&previous)?;
                if previous.thread_id != mapping.thread_id {
                    threads.remove(previous.thread_id.as_str())?;
                }
            }

            let json = serde_json::to_string(mapping)?;
            mappings.insert(mapping.conversation_id.as_str(), json.as_str())?;
            threads.insert(mapping.thread_id.as_str(), mapping.conversation_id.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Result<Option<Mapping>> {
        let txn = self.db.begin_read()?;
        let mappings = txn.open_table(MAPPINGS)?;
        let value = mappings
            .get(conversation_id.as_str())?
            .map(|guard| guard.value().to_owned());
        value.map(|json| Ok(serde_json::from_str(&json)?)).transpose()
    }

    pub fn get_by_thread(&self, thread_id: &ThreadId) -> Result<Option<Mapping>> {
        let txn = self.db.begin_read()?;
        let threads = txn.open_table(THREAD_INDEX)?;
        let conversation = threads
            .get(thread_id.as_str())?
            .map(|guard| ConversationId(guard.value().to_owned()));
        drop(threads);
        drop(txn);
        match conversation {
            Some(conversation) => self.get(&conversation),
            None => Ok(None),
        }
    }

    pub fn all_mappings(&self) -> Result<Vec<Mapping>> {
        let txn = self.db.begin_read()?;
        let mappings = txn.open_table(MAPPINGS)?;
        let mut out = Vec::new();
        for entry in mappings.iter()? {
            let (_, value) = entry?;
            out.push(serde_json::from_str(value.value())?);
        }
        Ok(out)
    }

    /// Idempotent: sets `claimed_at` iff absent. Returns true when this
    /// call performed the claim.
    pub fn mark_claimed(&self, conversation_id: &ConversationId, now_ms: i64) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let claimed_now;
        {
            let mut mappings = txn.open_table(MAPPINGS)?;
            let current = mappings
                .get(conversation_id.as_str())?
                .map(|guard| guard.value().to_owned());
            let Some(json) = current else {
                return Err(BridgeError::NotFound(format!(
                    "mapping for conversation {conversation_id}"
                )));
            };
            let mut mapping: Mapping = serde_json::from_str(&json)?;
            claimed_now = mapping.claimed_at.is_none();
            if claimed_now {
                mapping.claimed_at = Some(now_ms);
                let updated = serde_json::to_string(&mapping)?;
                mappings.insert(conversation_id.as_str(), updated.as_str())?;
            }
        }
        txn.commit()?;
        Ok(claimed_now)
    }

    /// Newest unclaimed mapping whose `created_at` lies within the
    /// freshness window. Read-only companion of
    /// [`Self::claim_most_recent_unclaimed`].
    pub fn most_recent_unclaimed_within(
        &self,
        freshness_ms: i64,
        now_ms: i64,
    ) -> Result<Option<Mapping>> {
        Ok(self
            .all_mappings()?
            .into_iter()
            .filter(|mapping| !mapping.is_claimed())
            .filter(|mapping| now_ms - mapping.created_at <= freshness_ms)
            .max_by_key(|mapping| mapping.created_at))
    }

    /// Atomically find and claim the newest fresh unclaimed mapping.
    /// Two concurrent callers can never claim the same mapping.
    pub fn claim_most_recent_unclaimed(
        &self,
        freshness_ms: i64,
        now_ms: i64,
    ) -> Result<Option<Mapping>> {
        let txn = self.db.begin_write()?;
        let claimed;
        {
            let mut mappings = txn.open_table(MAPPINGS)?;
            let mut candidate: Option<Mapping> = None;
            for entry in mappings.iter()? {
                let (_, value) = entry?;
                let mapping: Mapping = serde_json::from_str(value.value())?;
                if mapping.is_claimed() || now_ms - mapping.created_at > freshness_ms {
                    continue;
                }
                if candidate
                    .as_ref()
                    .is_none_or(|best| mapping.created_at > best.created_at)
                {
                    candidate = Some(mapping);
                }
            }
            claimed = candidate.map(|mut mapping| {
                mapping.claimed_at = Some(now_ms);
                mapping
            });
            if let Some(mapping) = &claimed {
                let json = serde_json::to_string(mapping)?;
                mappings.insert(mapping.conversation_id.as_str(), json.as_str())?;
            }
        }
        txn.commit()?;
        Ok(claimed)
    }

    // ── Seen conversations ──────────────────────────────────────────

    pub fn is_seen(&self, conversation_id: &ConversationId) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let seen = txn.open_table(SEEN)?;
        Ok(seen.get(conversation_id.as_str())?.is_some())
    }

    pub fn add_seen(&self, conversation_id: &ConversationId) -> Result<()> {
        self.set_insert(SEEN, conversation_id.as_str())
    }

    // ── Mirrored-archive bookkeeping ────────────────────────────────

    pub fn processed_archived(&self) -> Result<HashSet<ConversationId>> {
        let txn = self.db.begin_read()?;
        let archived = txn.open_table(ARCHIVED)?;
        let mut out = HashSet::new();
        for entry in archived.iter()? {
            let (key, _) = entry?;
            out.insert(ConversationId(key.value().to_owned()));
        }
        Ok(out)
    }

    pub fn add_processed_archived(&self, conversation_id: &ConversationId) -> Result<()> {
        self.set_insert(ARCHIVED, conversation_id.as_str())
    }

    pub fn remove_processed_archived(&self, conversation_id: &ConversationId) -> Result<()> {
        self.set_remove(ARCHIVED, conversation_id.as_str())
    }

    // ── Thread activity ─────────────────────────────────────────────

    pub fn record_activity(&self, thread_id: &ThreadId, at_ms: i64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut activity = txn.open_table(ACTIVITY)?;
            activity.insert(thread_id.as_str(), at_ms)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn activity_of(&self, thread_id: &ThreadId) -> Result<Option<i64>> {
        let txn = self.db.begin_read()?;
        let activity = txn.open_table(ACTIVITY)?;
        Ok(activity.get(thread_id.as_str())?.map(|guard| guard.value()))
    }

    // ── Explicit archive ────────────────────────────────────────────

    pub fn set_explicitly_archived(&self, thread_id: &ThreadId) -> Result<()> {
        self.set_insert(EXPLICIT_ARCHIVE, thread_id.as_str())
    }

    pub fn clear_explicitly_archived(&self, thread_id: &ThreadId) -> Result<()> {
        self.set_remove(EXPLICIT_ARCHIVE, thread_id.as_str())
    }

    pub fn is_explicitly_archived(&self, thread_id: &ThreadId) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let explicit = txn.open_table(EXPLICIT_ARCHIVE)?;
        Ok(explicit.get(thread_id.as_str())?.is_some())
    }

    // ── Configuration records ───────────────────────────────────────

    pub fn load_global_config(&self) -> Result<GlobalConfig> {
        Ok(self.load_record(KEY_GLOBAL_CONFIG)?.unwrap_or_default())
    }

    pub fn store_global_config(&self, config: &GlobalConfig) -> Result<()> {
        self.store_record(KEY_GLOBAL_CONFIG, config)
    }

    pub fn load_project_config(&self) -> Result<ProjectConfig> {
        Ok(self.load_record(KEY_PROJECT_CONFIG)?.unwrap_or_default())
    }

    pub fn store_project_config(&self, config: &ProjectConfig) -> Result<()> {
        self.store_record(KEY_PROJECT_CONFIG, config)
    }

    pub fn load_bot_token(&self) -> Result<Option<String>> {
        self.load_record(KEY_BOT_TOKEN)
    }

    pub fn store_bot_token(&self, token: &str) -> Result<()> {
        self.store_record(KEY_BOT_TOKEN, &token.to_owned())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn set_insert(&self, table: TableDefinition<&str, ()>, key: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut handle = txn.open_table(table)?;
            handle.insert(key, ())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn set_remove(&self, table: TableDefinition<&str, ()>, key: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut handle = txn.open_table(table)?;
            handle.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn load_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let txn = self.db.begin_read()?;
        let config = txn.open_table(CONFIG)?;
        let value = config.get(key)?.map(|guard| guard.value().to_owned());
        value.map(|json| Ok(serde_json::from_str(&json)?)).transpose()
    }

    fn store_record<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let txn = self.db.begin_write()?;
        {
            let mut config = txn.open_table(CONFIG)?;
            config.insert(key, json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// Single-slot record of the newest nameless conversation awaiting a
/// name. Replaced by newer nameless creations, cleared on bind.
#[derive(Default)]
pub struct PendingComposer {
    slot: Mutex<Option<ConversationId>>,
}

impl PendingComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new pending conversation, returning the one it
    /// replaced, if any.
    pub fn replace(&self, conversation_id: ConversationId) -> Option<ConversationId> {
        self.slot
            .lock()
            .expect("pending composer lock")
            .replace(conversation_id)
    }

    pub fn take(&self) -> Option<ConversationId> {
        self.slot.lock().expect("pending composer lock").take()
    }

    pub fn peek(&self) -> Option<ConversationId> {
        self.slot.lock().expect("pending composer lock").clone()
    }

    /// Put a conversation back unless a newer one took the slot while
    /// it was out.
    pub fn restore(&self, conversation_id: ConversationId) {
        let mut slot = self.slot.lock().expect("pending composer lock");
        if slot.is_none() {
            *slot = Some(conversation_id);
        }
    }

    /// Clear the slot iff it still holds the given conversation.
    pub fn clear_if(&self, conversation_id: &ConversationId) {
        let mut slot = self.slot.lock().expect("pending composer lock");
        if slot.as_ref() == Some(conversation_id) {
            *slot = None;
        }
    }
}

/// Freshness window for claimable mappings. Exists solely to keep an
/// agent from grabbing an orphaned mapping created in a previous
/// session; older unclaimed mappings are ignored by `resolve` forever
/// but remain for manual operations.
pub const RESOLVE_FRESHNESS_MS: i64 = 30_000;

const RESOLVE_WAIT: std::time::Duration = std::time::Duration::from_secs(6);
const RESOLVE_POLL: std::time::Duration = std::time::Duration::from_millis(200);

/// A successful resolve: which mapping, and which strategy found it.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub mapping: Mapping,
    pub method: crate::ResolveMethod,
}

/// Answers "which thread belongs to the calling agent" with the
/// three-strategy protocol: bind the pending composer, else claim the
/// latest fresh unclaimed mapping, else wait briefly for one to appear.
/// Every success claims the mapping immediately.
pub struct Resolver {
    registry: std::sync::Arc<MappingRegistry>,
    pending: std::sync::Arc<PendingComposer>,
    chat: std::sync::Arc<dyn crate::gateway::ChatPort>,
    source: std::sync::Arc<dyn crate::ide::ConversationSource>,
}

impl Resolver {
    pub fn new(
        registry: std::sync::Arc<MappingRegistry>,
        pending: std::sync::Arc<PendingComposer>,
        chat: std::sync::Arc<dyn crate::gateway::ChatPort>,
        source: std::sync::Arc<dyn crate::ide::ConversationSource>,
    ) -> Self {
        Self {
            registry,
            pending,
            chat,
            source,
        }
    }

    pub async fn resolve(&self) -> Result<Resolved> {
        use crate::ResolveMethod;

        // Strategy 1: a nameless conversation is waiting. Create its
        // thread now, under the placeholder if the IDE still has no
        // name (the name-sync watcher renames it later).
        if let Some(pending_id) = self.pending.take() {
            let name = self
                .source
                .name_of(&pending_id)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| crate::gateway::format::PLACEHOLDER_NAME.to_owned());
            match self.chat.create_thread(&pending_id, &name).await {
                Ok(_) => {
                    self.registry.mark_claimed(&pending_id, crate::now_ms())?;
                    let mapping = self.registry.get(&pending_id)?.ok_or_else(|| {
                        BridgeError::InvariantViolation(format!(
                            "mapping missing right after creation for {pending_id}"
                        ))
                    })?;
                    tracing::info!(conversation_id = %pending_id, "resolved via pending composer");
                    return Ok(Resolved {
                        mapping,
                        method: ResolveMethod::WaitedForNew,
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, conversation_id = %pending_id, "pending thread creation failed");
                    self.pending.restore(pending_id);
                }
            }
        }

        // Strategy 2: latest fresh unclaimed mapping.
        if let Some(mapping) = self
            .registry
            .claim_most_recent_unclaimed(RESOLVE_FRESHNESS_MS, crate::now_ms())?
        {
            tracing::info!(conversation_id = %mapping.conversation_id, "resolved latest unclaimed");
            return Ok(Resolved {
                mapping,
                method: ResolveMethod::LatestUnclaimed,
            });
        }

        // Strategy 3: short bounded wait for a mapping to appear.
        let mapping = self
            .wait_for_unclaimed_within(RESOLVE_WAIT, RESOLVE_POLL, RESOLVE_FRESHNESS_MS)
            .await?;
        tracing::info!(conversation_id = %mapping.conversation_id, "resolved after waiting");
        Ok(Resolved {
            mapping,
            method: ResolveMethod::WaitedForNew,
        })
    }

    /// Poll for (and claim) a fresh unclaimed mapping until the wait
    /// window closes.
    pub async fn wait_for_unclaimed_within(
        &self,
        max_wait: std::time::Duration,
        poll: std::time::Duration,
        freshness_ms: i64,
    ) -> Result<Mapping> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(mapping) = self
                .registry
                .claim_most_recent_unclaimed(freshness_ms, crate::now_ms())?
            {
                return Ok(mapping);
            }
            if tokio::time::Instant::now() + poll > deadline {
                return Err(BridgeError::Timeout);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
