//! The chat watcher: a single cooperative reconciliation loop.
//!
//! Ticks once a second. A tick that is still running when the next one
//! fires causes the new tick to be skipped entirely (reentrancy guard).
//! Step failures inside a tick are logged, the guard is released, and
//! the loop continues; a locked IDE database abandons the whole tick.

use crate::config::RuntimeConfig;
use crate::gateway::ChatPort;
use crate::ide::ConversationSource;
use crate::registry::{MappingRegistry, PendingComposer};
use crate::error::Result;
use crate::{ConversationId, now_ms};

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The inactivity reopener runs on every 30th tick.
const REOPEN_EVERY_TICKS: u64 = 30;

pub struct ChatWatcher {
    chat: Arc<dyn ChatPort>,
    source: Arc<dyn ConversationSource>,
    registry: Arc<MappingRegistry>,
    pending: Arc<PendingComposer>,
    config: Arc<ArcSwap<RuntimeConfig>>,
    ticking: AtomicBool,
    ticks: AtomicU64,
}

impl ChatWatcher {
    pub fn new(
        chat: Arc<dyn ChatPort>,
        source: Arc<dyn ConversationSource>,
        registry: Arc<MappingRegistry>,
        pending: Arc<PendingComposer>,
        config: Arc<ArcSwap<RuntimeConfig>>,
    ) -> Self {
        Self {
            chat,
            source,
            registry,
            pending,
            config,
            ticking: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("chat watcher stopping");
                        return;
                    }
                }
                _ = interval.tick() => {
                    if self
                        .ticking
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        tracing::debug!("previous tick still running, skipping");
                        continue;
                    }
                    if let Err(error) = self.tick().await {
                        tracing::warn!(%error, "chat watcher tick failed");
                    }
                    self.ticking.store(false, Ordering::Release);
                }
            }
        }
    }

    /// One reconciliation pass. Public so tests can drive it directly.
    pub async fn tick(&self) -> Result<()> {
        let tick_number = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        self.detect_new_conversations().await?;
        self.bind_pending_composer().await;
        self.mirror_archives().await?;
        self.mirror_unarchives().await?;

        if tick_number % REOPEN_EVERY_TICKS == 0 {
            self.reopen_active_threads().await?;
        }
        Ok(())
    }

    /// Any conversation id never seen before is new: named ones get a
    /// thread immediately, nameless ones become the pending composer.
    async fn detect_new_conversations(&self) -> Result<()> {
        for id in self.source.all_ids().await? {
            if self.registry.is_seen(&id)? {
                continue;
            }
            self.registry.add_seen(&id)?;

            match self.source.name_of(&id).await? {
                Some(name) => {
                    tracing::info!(conversation_id = %id, name, "new named conversation");
                    if let Err(error) = self.chat.create_thread(&id, &name).await {
                        tracing::warn!(%error, conversation_id = %id, "thread creation failed");
                    }
                }
                None => {
                    if let Some(replaced) = self.pending.replace(id.clone()) {
                        tracing::info!(
                            conversation_id = %id,
                            replaced = %replaced,
                            "pending composer replaced by newer nameless conversation"
                        );
                    } else {
                        tracing::info!(conversation_id = %id, "new nameless conversation pending");
                    }
                }
            }
        }
        Ok(())
    }

    /// If the pending conversation has gained a name, bind it now.
    async fn bind_pending_composer(&self) {
        let Some(id) = self.pending.peek() else { return };
        let Ok(Some(name)) = self.source.name_of(&id).await else {
            return;
        };
        match self.chat.create_thread(&id, &name).await {
            Ok(thread_id) => {
                self.pending.clear_if(&id);
                tracing::info!(conversation_id = %id, thread_id = %thread_id, "pending composer bound");
            }
            Err(error) => {
                tracing::warn!(%error, conversation_id = %id, "pending thread creation failed");
            }
        }
    }

    /// IDE → chat: conversations newly archived in the IDE get their
    /// thread archived. Failures retry next tick (the id is only marked
    /// processed once the archive call succeeded or no mapping exists).
    async fn mirror_archives(&self) -> Result<()> {
        let archived = self.source.archived_ids().await?;
        let processed = self.registry.processed_archived()?;

        for id in archived.difference(&processed) {
            if let Some(mapping) = self.registry.get(id)? {
                if let Err(error) = self.chat.archive_thread(&mapping.thread_id).await {
                    tracing::warn!(%error, conversation_id = %id, "archive mirroring failed");
                    continue;
                }
                tracing::info!(conversation_id = %id, thread_id = %mapping.thread_id, "conversation archived, thread closed");
            }
            self.registry.add_processed_archived(id)?;
        }
        Ok(())
    }

    /// IDE → chat: conversations restored in the IDE get their thread
    /// reopened and any explicit-archive flag cleared.
    async fn mirror_unarchives(&self) -> Result<()> {
        let archived = self.source.archived_ids().await?;
        let processed = self.registry.processed_archived()?;

        for id in processed.difference(&archived) {
            if let Some(mapping) = self.registry.get(id)? {
                self.registry.clear_explicitly_archived(&mapping.thread_id)?;
                if let Err(error) = self.chat.unarchive_thread(&mapping.thread_id).await {
                    tracing::warn!(%error, conversation_id = %id, "unarchive mirroring failed");
                    continue;
                }
                tracing::info!(conversation_id = %id, thread_id = %mapping.thread_id, "conversation restored, thread reopened");
            }
            self.registry.remove_processed_archived(id)?;
        }
        Ok(())
    }

    /// Reopen archived threads of truly-active conversations: those in
    /// the top-N by recency or touched within the last H hours.
    /// Explicitly archived threads stay closed. Returns the reopen
    /// count.
    pub async fn reopen_active_threads(&self) -> Result<usize> {
        let config = self.config.load();
        let ranked = self.source.active_ranked_by_recency().await?;
        let now = now_ms();
        let recency_window_ms = i64::from(config.global.implicit_archive_hours) * 3_600_000;

        let truly_active: Vec<ConversationId> = ranked
            .iter()
            .filter(|entry| {
                (entry.position as u32) < config.global.implicit_archive_count
                    || entry
                        .last_updated_at
                        .is_some_and(|updated| now - updated < recency_window_ms)
            })
            .map(|entry| entry.id.clone())
            .collect();

        let mut reopened = 0;
        for id in &truly_active {
            let Some(mapping) = self.registry.get(id)? else {
                continue;
            };
            if self.registry.is_explicitly_archived(&mapping.thread_id)? {
                continue;
            }
            if self.chat.is_thread_archived(&mapping.thread_id).await? != Some(true) {
                continue;
            }
            match self.chat.unarchive_thread(&mapping.thread_id).await {
                Ok(()) => reopened += 1,
                Err(error) => {
                    tracing::warn!(%error, thread_id = %mapping.thread_id, "reopen failed");
                }
            }
        }

        if reopened > 0 {
            tracing::info!(reopened, "reopened threads for active conversations");
        }
        Ok(reopened)
    }
}
