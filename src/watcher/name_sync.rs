//! The name sync watcher: renames threads when the IDE assigns a name
//! to a previously unnamed conversation.
//!
//! Triple-redundant triggering, because the IDE's SQLite file has no
//! change-notification channel and file watches alone miss events on
//! some platforms:
//!
//! - primary: native watches on the database and its WAL, debounced
//! - backup: an unconditional poll every 30 s
//! - watchdog: every 60 s, re-attach watches for files that appeared
//!   (or re-appeared) since the last check

use crate::gateway::ChatPort;
use crate::gateway::format::PLACEHOLDER_NAME;
use crate::ide::ConversationSource;
use crate::registry::MappingRegistry;
use crate::error::Result;
use crate::ConversationId;

use notify::Watcher as _;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

/// Cache-entry prefix marking a mapping whose thread is gone. Stale
/// entries are never overwritten with real names and never retried.
pub const STALE_PREFIX: &str = "__STALE__";

const DEBOUNCE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_secs(30);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct NameSyncWatcher {
    chat: Arc<dyn ChatPort>,
    source: Arc<dyn ConversationSource>,
    registry: Arc<MappingRegistry>,
    /// conversation id → last known thread name (or stale sentinel).
    cache: Mutex<HashMap<ConversationId, String>>,
    /// Overlapping sync passes return immediately.
    sync_lock: Mutex<()>,
    watch_paths: Vec<PathBuf>,
}

impl NameSyncWatcher {
    pub fn new(
        chat: Arc<dyn ChatPort>,
        source: Arc<dyn ConversationSource>,
        registry: Arc<MappingRegistry>,
        watch_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            chat,
            source,
            registry,
            cache: Mutex::new(HashMap::new()),
            sync_lock: Mutex::new(()),
            watch_paths,
        }
    }

    /// Seed the cache from the chat service, not the IDE, so name
    /// mismatches present at startup are caught by the first pass. A
    /// mapping whose thread cannot be fetched is marked stale.
    pub async fn seed_cache(&self) -> Result<()> {
        for mapping in self.registry.all_mappings()? {
            match self.chat.thread_name(&mapping.thread_id).await {
                Ok(name) => {
                    self.cache
                        .lock()
                        .await
                        .insert(mapping.conversation_id, name);
                }
                Err(error) if error.is_not_found() => {
                    tracing::warn!(
                        conversation_id = %mapping.conversation_id,
                        thread_id = %mapping.thread_id,
                        "thread not fetchable, marking mapping stale"
                    );
                    let sentinel = format!("{STALE_PREFIX}{}", mapping.conversation_id);
                    self.cache
                        .lock()
                        .await
                        .insert(mapping.conversation_id, sentinel);
                }
                Err(error) => {
                    tracing::warn!(%error, thread_id = %mapping.thread_id, "name seed fetch failed");
                }
            }
        }
        Ok(())
    }

    /// One reconcile pass. Returns the number of rename calls issued;
    /// zero on a quiescent system (the fixed point).
    pub async fn sync_pass(&self) -> Result<usize> {
        let Ok(_guard) = self.sync_lock.try_lock() else {
            tracing::debug!("name sync already in progress");
            return Ok(0);
        };

        let names = self.source.all_names().await?;
        let mut renames = 0;

        for mapping in self.registry.all_mappings()? {
            let Some(current) = names.get(&mapping.conversation_id) else {
                continue;
            };

            let cached = self
                .cache
                .lock()
                .await
                .get(&mapping.conversation_id)
                .cloned();
            if cached
                .as_deref()
                .is_some_and(|entry| entry.starts_with(STALE_PREFIX))
            {
                continue;
            }

            let needs_rename = match cached.as_deref() {
                None => true,
                Some(cached) => cached != current || cached == PLACEHOLDER_NAME,
            };
            if !needs_rename {
                continue;
            }

            match self.chat.rename_thread(&mapping.thread_id, current).await {
                Ok(()) => {
                    renames += 1;
                    self.cache
                        .lock()
                        .await
                        .insert(mapping.conversation_id.clone(), current.clone());
                }
                Err(error) if error.is_not_found() => {
                    // Stop retrying this mapping until it is re-validated.
                    let sentinel = format!("{STALE_PREFIX}{}", mapping.conversation_id);
                    self.cache
                        .lock()
                        .await
                        .insert(mapping.conversation_id.clone(), sentinel);
                    tracing::warn!(
                        thread_id = %mapping.thread_id,
                        "rename target gone, marking mapping stale"
                    );
                }
                Err(error) => {
                    tracing::warn!(%error, thread_id = %mapping.thread_id, "rename failed");
                }
            }
        }

        Ok(renames)
    }

    /// Cached name for a conversation (tests and diagnostics).
    pub async fn cached_name(&self, conversation_id: &ConversationId) -> Option<String> {
        self.cache.lock().await.get(conversation_id).cloned()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = match notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            if result.is_ok() {
                let _ = fs_tx.send(());
            }
        }) {
            Ok(watcher) => Some(watcher),
            Err(error) => {
                tracing::warn!(%error, "file watcher unavailable, relying on polling");
                None
            }
        };

        let mut existed: HashMap<PathBuf, bool> = HashMap::new();
        let mut watched: HashSet<PathBuf> = HashSet::new();
        self.attach_watches(&mut watcher, &mut watched, &mut existed);

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        let mut debounce_deadline: Option<tokio::time::Instant> = None;
        let far_future = || tokio::time::Instant::now() + Duration::from_secs(86_400);

        loop {
            let deadline = debounce_deadline.unwrap_or_else(far_future);
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("name sync watcher stopping");
                        return;
                    }
                }
                Some(()) = fs_rx.recv() => {
                    debounce_deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                }
                _ = tokio::time::sleep_until(deadline), if debounce_deadline.is_some() => {
                    debounce_deadline = None;
                    if let Err(error) = self.sync_pass().await {
                        tracing::warn!(%error, "debounced name sync failed");
                    }
                }
                _ = poll.tick() => {
                    if let Err(error) = self.sync_pass().await {
                        tracing::warn!(%error, "polled name sync failed");
                    }
                }
                _ = watchdog.tick() => {
                    self.attach_watches(&mut watcher, &mut watched, &mut existed);
                }
            }
        }
    }

    /// (Re-)attach watches: any path that exists now but did not at the
    /// last check gets a fresh watch, replacing a possibly dropped one.
    fn attach_watches(
        &self,
        watcher: &mut Option<notify::RecommendedWatcher>,
        watched: &mut HashSet<PathBuf>,
        existed: &mut HashMap<PathBuf, bool>,
    ) {
        let Some(watcher) = watcher.as_mut() else { return };

        for path in &self.watch_paths {
            let exists_now = path.exists();
            let existed_before = existed.insert(path.clone(), exists_now).unwrap_or(false);

            let needs_attach = exists_now && (!watched.contains(path) || !existed_before);
            if !needs_attach {
                continue;
            }
            if watched.contains(path) {
                let _ = watcher.unwatch(path);
            }
            match watcher.watch(path, notify::RecursiveMode::NonRecursive) {
                Ok(()) => {
                    watched.insert(path.clone());
                    tracing::debug!(path = %path.display(), "watching IDE state file");
                }
                Err(error) => {
                    watched.remove(path);
                    tracing::warn!(%error, path = %path.display(), "file watch failed");
                }
            }
        }
    }
}
