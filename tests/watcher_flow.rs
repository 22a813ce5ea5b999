//! Chat watcher reconciliation against mock ports.

mod common;

use common::{MockChat, MockSource, mapping, test_registry};

use bridgebot::config::RuntimeConfig;
use bridgebot::registry::PendingComposer;
use bridgebot::watcher::ChatWatcher;
use bridgebot::{ConversationId, now_ms};

use arc_swap::ArcSwap;
use std::sync::Arc;

fn build_watcher(
    chat: &Arc<MockChat>,
    source: &Arc<MockSource>,
    registry: &Arc<bridgebot::registry::MappingRegistry>,
    config: RuntimeConfig,
) -> (Arc<ChatWatcher>, Arc<PendingComposer>) {
    let pending = Arc::new(PendingComposer::new());
    let watcher = Arc::new(ChatWatcher::new(
        Arc::clone(chat) as _,
        Arc::clone(source) as _,
        Arc::clone(registry),
        Arc::clone(&pending),
        Arc::new(ArcSwap::from_pointee(config)),
    ));
    (watcher, pending)
}

#[tokio::test]
async fn nameless_conversation_becomes_pending_then_bound() {
    let (_dir, registry) = test_registry();
    let chat = MockChat::new(Arc::clone(&registry));
    let source = MockSource::new();
    let (watcher, pending) = build_watcher(&chat, &source, &registry, RuntimeConfig::default());

    source.add_conversation("C1", None);

    // Tick 1: no thread yet, C1 parked as the pending composer.
    watcher.tick().await.unwrap();
    assert!(chat.created().is_empty());
    assert_eq!(pending.peek(), Some(ConversationId::from("C1")));

    // Tick 2: still nameless, nothing changes.
    watcher.tick().await.unwrap();
    assert!(chat.created().is_empty());

    // The first turn finishes and the IDE names the conversation.
    source.set_name("C1", "Refactor parser");
    watcher.tick().await.unwrap();

    assert_eq!(
        chat.created(),
        vec![(ConversationId::from("C1"), "Refactor parser".to_owned())]
    );
    let bound = registry.get(&"C1".into()).unwrap().expect("mapping created");
    assert_eq!(pending.peek(), None);
    assert!(chat.thread(bound.thread_id.as_str()).name == "Refactor parser");
}

#[tokio::test]
async fn named_conversation_gets_thread_immediately() {
    let (_dir, registry) = test_registry();
    let chat = MockChat::new(Arc::clone(&registry));
    let source = MockSource::new();
    let (watcher, pending) = build_watcher(&chat, &source, &registry, RuntimeConfig::default());

    source.add_conversation("C1", Some("Fix flaky test"));
    watcher.tick().await.unwrap();

    assert_eq!(chat.created().len(), 1);
    assert!(registry.get(&"C1".into()).unwrap().is_some());
    assert_eq!(pending.peek(), None);

    // Already seen: later ticks do not create a second thread.
    watcher.tick().await.unwrap();
    assert_eq!(chat.created().len(), 1);
}

#[tokio::test]
async fn newer_nameless_conversation_replaces_pending() {
    let (_dir, registry) = test_registry();
    let chat = MockChat::new(Arc::clone(&registry));
    let source = MockSource::new();
    let (watcher, pending) = build_watcher(&chat, &source, &registry, RuntimeConfig::default());

    source.add_conversation("C1", None);
    watcher.tick().await.unwrap();
    assert_eq!(pending.peek(), Some(ConversationId::from("C1")));

    source.add_conversation("C2", None);
    watcher.tick().await.unwrap();
    assert_eq!(pending.peek(), Some(ConversationId::from("C2")));
}

#[tokio::test]
async fn archive_and_unarchive_mirror_to_threads() {
    let (_dir, registry) = test_registry();
    let chat = MockChat::new(Arc::clone(&registry));
    let source = MockSource::new();
    let (watcher, _pending) = build_watcher(&chat, &source, &registry, RuntimeConfig::default());

    source.add_conversation("C1", Some("Build pipeline"));
    watcher.tick().await.unwrap();
    let thread_id = registry.get(&"C1".into()).unwrap().unwrap().thread_id;

    source.set_archived("C1", true);
    watcher.tick().await.unwrap();
    assert!(chat.thread(thread_id.as_str()).archived);
    assert!(
        registry
            .processed_archived()
            .unwrap()
            .contains(&ConversationId::from("C1"))
    );

    // A second tick does not re-archive (the processed set gates it).
    watcher.tick().await.unwrap();

    // The IDE restores the conversation: thread reopens, explicit flag
    // cleared, processed entry removed.
    registry.set_explicitly_archived(&thread_id).unwrap();
    source.set_archived("C1", false);
    watcher.tick().await.unwrap();
    assert!(!chat.thread(thread_id.as_str()).archived);
    assert!(!registry.is_explicitly_archived(&thread_id).unwrap());
    assert!(registry.processed_archived().unwrap().is_empty());
}

#[tokio::test]
async fn implicit_archive_policy_reopens_truly_active() {
    let (_dir, registry) = test_registry();
    let chat = MockChat::new(Arc::clone(&registry));
    let source = MockSource::new();

    let mut config = RuntimeConfig::default();
    config.global.implicit_archive_count = 2;
    config.global.implicit_archive_hours = 1;
    let (watcher, _pending) = build_watcher(&chat, &source, &registry, config);

    let now = now_ms();
    let minutes = |m: i64| m * 60_000;
    for (conversation, thread) in [("C1", "T1"), ("C2", "T2"), ("C3", "T3"), ("C4", "T4")] {
        registry
            .insert_mapping(&mapping(conversation, thread, now))
            .unwrap();
        chat.add_thread(thread, conversation, true);
    }
    source.set_ranked(vec![
        ("C1", Some(now)),
        ("C2", Some(now - minutes(10))),
        ("C3", Some(now - minutes(90))),
        ("C4", Some(now - minutes(10))),
    ]);

    // C1 and C2 by rank, C4 by recency; C3 fails both tests.
    let reopened = watcher.reopen_active_threads().await.unwrap();
    assert_eq!(reopened, 3);
    assert!(!chat.thread("T1").archived);
    assert!(!chat.thread("T2").archived);
    assert!(chat.thread("T3").archived);
    assert!(!chat.thread("T4").archived);
}

#[tokio::test]
async fn explicitly_archived_threads_are_not_reopened() {
    let (_dir, registry) = test_registry();
    let chat = MockChat::new(Arc::clone(&registry));
    let source = MockSource::new();
    let (watcher, _pending) = build_watcher(&chat, &source, &registry, RuntimeConfig::default());

    let now = now_ms();
    registry.insert_mapping(&mapping("C1", "T1", now)).unwrap();
    chat.add_thread("T1", "C1", true);
    registry.set_explicitly_archived(&"T1".into()).unwrap();
    source.set_ranked(vec![("C1", Some(now))]);

    let reopened = watcher.reopen_active_threads().await.unwrap();
    assert_eq!(reopened, 0);
    assert!(chat.thread("T1").archived);
}

#[tokio::test]
async fn open_threads_are_left_alone() {
    let (_dir, registry) = test_registry();
    let chat = MockChat::new(Arc::clone(&registry));
    let source = MockSource::new();
    let (watcher, _pending) = build_watcher(&chat, &source, &registry, RuntimeConfig::default());

    let now = now_ms();
    registry.insert_mapping(&mapping("C1", "T1", now)).unwrap();
    chat.add_thread("T1", "C1", false);
    source.set_ranked(vec![("C1", Some(now))]);

    assert_eq!(watcher.reopen_active_threads().await.unwrap(), 0);
}
