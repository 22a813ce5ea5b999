//! In-memory ports shared by the integration tests.

#![allow(dead_code)]

use bridgebot::error::{BridgeError, Result};
use bridgebot::gateway::{ChatPort, FilePayload};
use bridgebot::ide::store::{ConversationSource, RankedConversation};
use bridgebot::ide::ConversationDelivery;
use bridgebot::registry::MappingRegistry;
use bridgebot::{ConversationId, Mapping, MessageId, ThreadId, now_ms};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub fn test_registry() -> (tempfile::TempDir, Arc<MappingRegistry>) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MappingRegistry::open(&dir.path().join("state.redb")).unwrap());
    (dir, registry)
}

pub fn mapping(conversation: &str, thread: &str, created_at: i64) -> Mapping {
    Mapping {
        conversation_id: conversation.into(),
        thread_id: thread.into(),
        workspace: "demo".into(),
        created_at,
        claimed_at: None,
    }
}

// ── Mock chat gateway ───────────────────────────────────────────────

#[derive(Default)]
pub struct MockThread {
    pub name: String,
    pub archived: bool,
    pub posts: Vec<String>,
    pub plain: Vec<(MessageId, String)>,
    pub edits: Vec<(MessageId, String, Option<Value>)>,
    pub replies: Vec<(MessageId, String)>,
    pub reactions: Vec<(MessageId, String)>,
    pub files: Vec<String>,
    pub typing: bool,
}

#[derive(Default)]
pub struct MockChatState {
    pub threads: HashMap<ThreadId, MockThread>,
    pub created: Vec<(ConversationId, String)>,
    pub unfetchable: HashSet<ThreadId>,
    pub rename_calls: Vec<(ThreadId, String)>,
    pub interaction_responses: Vec<(String, Value)>,
    pub fail_create: bool,
}

pub struct MockChat {
    registry: Arc<MappingRegistry>,
    counter: AtomicU64,
    pub state: Mutex<MockChatState>,
}

impl MockChat {
    pub fn new(registry: Arc<MappingRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            counter: AtomicU64::new(0),
            state: Mutex::new(MockChatState::default()),
        })
    }

    pub fn add_thread(&self, thread: &str, name: &str, archived: bool) {
        self.state.lock().unwrap().threads.insert(
            thread.into(),
            MockThread {
                name: name.to_owned(),
                archived,
                ..Default::default()
            },
        );
    }

    pub fn set_unfetchable(&self, thread: &str) {
        self.state.lock().unwrap().unfetchable.insert(thread.into());
    }

    pub fn thread(&self, thread: &str) -> MockThreadView {
        let state = self.state.lock().unwrap();
        let entry = state.threads.get(&ThreadId::from(thread)).expect("thread exists");
        MockThreadView {
            name: entry.name.clone(),
            archived: entry.archived,
            posts: entry.posts.clone(),
            plain: entry.plain.clone(),
            edits: entry.edits.clone(),
            replies: entry.replies.clone(),
            reactions: entry.reactions.clone(),
            typing: entry.typing,
        }
    }

    pub fn created(&self) -> Vec<(ConversationId, String)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn rename_calls(&self) -> Vec<(ThreadId, String)> {
        self.state.lock().unwrap().rename_calls.clone()
    }

    fn check_fetchable(&self, state: &MockChatState, thread_id: &ThreadId) -> Result<()> {
        if state.unfetchable.contains(thread_id) || !state.threads.contains_key(thread_id) {
            return Err(BridgeError::NotFound(format!("thread {thread_id}")));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockThreadView {
    pub name: String,
    pub archived: bool,
    pub posts: Vec<String>,
    pub plain: Vec<(MessageId, String)>,
    pub edits: Vec<(MessageId, String, Option<Value>)>,
    pub replies: Vec<(MessageId, String)>,
    pub reactions: Vec<(MessageId, String)>,
    pub typing: bool,
}

#[async_trait]
impl ChatPort for MockChat {
    async fn create_thread(
        &self,
        conversation_id: &ConversationId,
        name: &str,
    ) -> Result<ThreadId> {
        if name.trim().is_empty() {
            return Err(BridgeError::MissingParameter("name"));
        }
        let thread_id = {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                return Err(BridgeError::NotConnected);
            }
            let thread_id =
                ThreadId(format!("T{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1));
            state.threads.insert(
                thread_id.clone(),
                MockThread {
                    name: name.to_owned(),
                    ..Default::default()
                },
            );
            state.created.push((conversation_id.clone(), name.to_owned()));
            thread_id
        };
        self.registry.insert_mapping(&Mapping {
            conversation_id: conversation_id.clone(),
            thread_id: thread_id.clone(),
            workspace: "demo".into(),
            created_at: now_ms(),
            claimed_at: None,
        })?;
        Ok(thread_id)
    }

    async fn post_to_thread(&self, thread_id: &ThreadId, text: &str, _as_embed: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state
            .threads
            .get_mut(thread_id)
            .expect("checked")
            .posts
            .push(text.to_owned());
        Ok(())
    }

    async fn post_plain(&self, thread_id: &ThreadId, text: &str) -> Result<MessageId> {
        let message_id = MessageId(format!("M{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1));
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state
            .threads
            .get_mut(thread_id)
            .expect("checked")
            .plain
            .push((message_id.clone(), text.to_owned()));
        Ok(message_id)
    }

    async fn edit_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        content: &str,
        components: Option<Value>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state
            .threads
            .get_mut(thread_id)
            .expect("checked")
            .edits
            .push((message_id.clone(), content.to_owned(), components));
        Ok(())
    }

    async fn reply_to_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state
            .threads
            .get_mut(thread_id)
            .expect("checked")
            .replies
            .push((message_id.clone(), text.to_owned()));
        Ok(())
    }

    async fn react(&self, thread_id: &ThreadId, message_id: &MessageId, emoji: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state
            .threads
            .get_mut(thread_id)
            .expect("checked")
            .reactions
            .push((message_id.clone(), emoji.to_owned()));
        Ok(())
    }

    async fn send_file(
        &self,
        thread_id: &ThreadId,
        _file: FilePayload,
        name: Option<&str>,
        _description: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state
            .threads
            .get_mut(thread_id)
            .expect("checked")
            .files
            .push(name.unwrap_or("attachment.bin").to_owned());
        Ok(())
    }

    async fn rename_thread(&self, thread_id: &ThreadId, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state.rename_calls.push((thread_id.clone(), name.to_owned()));
        state.threads.get_mut(thread_id).expect("checked").name = name.to_owned();
        Ok(())
    }

    async fn thread_name(&self, thread_id: &ThreadId) -> Result<String> {
        let state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        Ok(state.threads.get(thread_id).expect("checked").name.clone())
    }

    async fn archive_thread(&self, thread_id: &ThreadId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state.threads.get_mut(thread_id).expect("checked").archived = true;
        Ok(())
    }

    async fn unarchive_thread(&self, thread_id: &ThreadId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state.threads.get_mut(thread_id).expect("checked").archived = false;
        Ok(())
    }

    async fn is_thread_archived(&self, thread_id: &ThreadId) -> Result<Option<bool>> {
        let state = self.state.lock().unwrap();
        if state.unfetchable.contains(thread_id) {
            return Ok(None);
        }
        Ok(state.threads.get(thread_id).map(|thread| thread.archived))
    }

    async fn start_typing(&self, thread_id: &ThreadId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check_fetchable(&state, thread_id)?;
        state.threads.get_mut(thread_id).expect("checked").typing = true;
        Ok(())
    }

    async fn stop_typing(&self, thread_id: &ThreadId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(thread) = state.threads.get_mut(thread_id) {
            thread.typing = false;
        }
        Ok(())
    }

    async fn respond_interaction(
        &self,
        interaction_id: &str,
        _token: &str,
        response: Value,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .interaction_responses
            .push((interaction_id.to_owned(), response));
        Ok(())
    }
}

// ── Mock IDE conversation source ────────────────────────────────────

#[derive(Default)]
pub struct MockSourceState {
    pub ids: Vec<ConversationId>,
    pub names: HashMap<ConversationId, String>,
    pub archived: HashSet<ConversationId>,
    pub ranked: Vec<RankedConversation>,
}

#[derive(Default)]
pub struct MockSource {
    pub state: Mutex<MockSourceState>,
}

impl MockSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conversation(&self, id: &str, name: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.ids.push(id.into());
        if let Some(name) = name {
            state.names.insert(id.into(), name.to_owned());
        }
    }

    pub fn set_name(&self, id: &str, name: &str) {
        self.state.lock().unwrap().names.insert(id.into(), name.to_owned());
    }

    pub fn set_archived(&self, id: &str, archived: bool) {
        let mut state = self.state.lock().unwrap();
        if archived {
            state.archived.insert(id.into());
        } else {
            state.archived.remove(&ConversationId::from(id));
        }
    }

    pub fn set_ranked(&self, ranked: Vec<(&str, Option<i64>)>) {
        self.state.lock().unwrap().ranked = ranked
            .into_iter()
            .enumerate()
            .map(|(position, (id, last_updated_at))| RankedConversation {
                id: id.into(),
                last_updated_at,
                position,
            })
            .collect();
    }
}

#[async_trait]
impl ConversationSource for MockSource {
    async fn all_ids(&self) -> Result<Vec<ConversationId>> {
        Ok(self.state.lock().unwrap().ids.clone())
    }

    async fn name_of(&self, id: &ConversationId) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().names.get(id).cloned())
    }

    async fn all_names(&self) -> Result<HashMap<ConversationId, String>> {
        Ok(self.state.lock().unwrap().names.clone())
    }

    async fn archived_ids(&self) -> Result<HashSet<ConversationId>> {
        Ok(self.state.lock().unwrap().archived.clone())
    }

    async fn active_ranked_by_recency(&self) -> Result<Vec<RankedConversation>> {
        Ok(self.state.lock().unwrap().ranked.clone())
    }
}

// ── Mock IDE delivery ───────────────────────────────────────────────

#[derive(Default)]
pub struct MockDelivery {
    pub delivered: Mutex<Vec<(ConversationId, String, Option<ThreadId>)>>,
    pub fail: AtomicBool,
}

impl MockDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(ConversationId, String, Option<ThreadId>)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationDelivery for MockDelivery {
    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        thread_id: Option<&ThreadId>,
    ) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(BridgeError::AccessibilityDenied("injection refused".into()));
        }
        self.delivered.lock().unwrap().push((
            conversation_id.clone(),
            text.to_owned(),
            thread_id.cloned(),
        ));
        Ok(())
    }
}
