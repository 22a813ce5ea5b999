//! Inbound event routing: message forwarding, archive-transition
//! classification, and their interplay with the reopen policy.

mod common;

use common::{MockChat, MockDelivery, MockSource, mapping, test_registry};

use bridgebot::config::RuntimeConfig;
use bridgebot::gateway::{EventRouter, ThreadCells, WireEvent};
use bridgebot::interaction::{InteractionManager, QuestionOption};
use bridgebot::registry::PendingComposer;
use bridgebot::watcher::ChatWatcher;
use bridgebot::{ConversationId, ThreadId, now_ms};

use arc_swap::ArcSwap;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct Rig {
    _dir: tempfile::TempDir,
    registry: Arc<bridgebot::registry::MappingRegistry>,
    chat: Arc<MockChat>,
    delivery: Arc<MockDelivery>,
    interactions: Arc<InteractionManager>,
    cells: Arc<ThreadCells>,
    connected: Arc<AtomicBool>,
    router: Arc<EventRouter>,
}

fn build() -> Rig {
    let (dir, registry) = test_registry();
    let chat = MockChat::new(Arc::clone(&registry));
    let delivery = MockDelivery::new();
    let interactions = Arc::new(InteractionManager::new(Arc::clone(&chat) as _));
    let cells = Arc::new(ThreadCells::new());
    let connected = Arc::new(AtomicBool::new(false));
    let router = Arc::new(EventRouter::new(
        Arc::clone(&chat) as _,
        Arc::clone(&registry),
        Arc::clone(&interactions),
        Arc::clone(&delivery) as _,
        Arc::clone(&cells),
        Arc::clone(&connected),
    ));
    Rig {
        _dir: dir,
        registry,
        chat,
        delivery,
        interactions,
        cells,
        connected,
        router,
    }
}

fn message_event(thread: &str, message: &str, author: &str, content: &str) -> WireEvent {
    WireEvent::Dispatch {
        name: "MESSAGE_CREATE".into(),
        payload: json!({
            "id": message,
            "channel_id": thread,
            "content": content,
            "author": { "id": author, "bot": false },
        }),
    }
}

fn thread_update_event(thread: &str, archived: bool, auto_archive_minutes: i64) -> WireEvent {
    WireEvent::Dispatch {
        name: "THREAD_UPDATE".into(),
        payload: json!({
            "id": thread,
            "thread_metadata": {
                "archived": archived,
                "auto_archive_duration": auto_archive_minutes,
            },
        }),
    }
}

#[tokio::test]
async fn ready_flips_connected_flag() {
    let rig = build();
    assert!(!rig.connected.load(Ordering::Relaxed));
    rig.router
        .handle(WireEvent::Ready {
            bot_user_id: "bot1".into(),
            session_id: "s1".into(),
        })
        .await
        .unwrap();
    assert!(rig.connected.load(Ordering::Relaxed));

    rig.router
        .handle(WireEvent::Disconnected { reason: "test".into() })
        .await
        .unwrap();
    assert!(!rig.connected.load(Ordering::Relaxed));
}

#[tokio::test]
async fn inbound_message_is_forwarded_and_acknowledged() {
    let rig = build();
    rig.registry.insert_mapping(&mapping("C1", "T1", now_ms())).unwrap();
    rig.chat.add_thread("T1", "demo", false);

    rig.router
        .handle(message_event("T1", "m1", "user9", "please fix the parser"))
        .await
        .unwrap();

    assert_eq!(
        rig.delivery.messages(),
        vec![(
            ConversationId::from("C1"),
            "please fix the parser".to_owned(),
            Some(ThreadId::from("T1")),
        )]
    );
    // Activity recorded, success reaction added, speaker remembered.
    assert!(rig.registry.activity_of(&"T1".into()).unwrap().is_some());
    let view = rig.chat.thread("T1");
    assert_eq!(view.reactions.len(), 1);
    assert_eq!(view.reactions[0].1, "✅");
    let speaker = rig.cells.take_recent_speaker(&"T1".into()).await.unwrap();
    assert_eq!(speaker.user_id, "user9");
}

#[tokio::test]
async fn bot_and_unmapped_messages_are_ignored() {
    let rig = build();
    rig.registry.insert_mapping(&mapping("C1", "T1", now_ms())).unwrap();
    rig.chat.add_thread("T1", "demo", false);

    rig.router
        .handle(WireEvent::Ready { bot_user_id: "bot1".into(), session_id: "s".into() })
        .await
        .unwrap();

    // Our own id, a flagged bot, and an unmapped thread: all dropped.
    rig.router
        .handle(message_event("T1", "m1", "bot1", "self echo"))
        .await
        .unwrap();
    rig.router
        .handle(WireEvent::Dispatch {
            name: "MESSAGE_CREATE".into(),
            payload: json!({
                "id": "m2",
                "channel_id": "T1",
                "content": "beep",
                "author": { "id": "other-bot", "bot": true },
            }),
        })
        .await
        .unwrap();
    rig.router
        .handle(message_event("T_unknown", "m3", "user", "hi"))
        .await
        .unwrap();

    assert!(rig.delivery.messages().is_empty());
}

#[tokio::test]
async fn failed_delivery_posts_a_reply() {
    let rig = build();
    rig.registry.insert_mapping(&mapping("C1", "T1", now_ms())).unwrap();
    rig.chat.add_thread("T1", "demo", false);
    rig.delivery.fail.store(true, Ordering::Relaxed);

    rig.router
        .handle(message_event("T1", "m1", "user9", "hello"))
        .await
        .unwrap();

    let view = rig.chat.thread("T1");
    assert!(view.reactions.is_empty());
    assert_eq!(view.replies.len(), 1);
    assert!(view.replies[0].1.contains("Could not deliver"));
}

#[tokio::test]
async fn text_reply_resolves_question_instead_of_forwarding() {
    let rig = build();
    rig.registry.insert_mapping(&mapping("C1", "T1", now_ms())).unwrap();
    rig.chat.add_thread("T1", "demo", false);

    let ask = tokio::spawn({
        let interactions = Arc::clone(&rig.interactions);
        async move {
            interactions
                .ask(
                    &"T1".into(),
                    "Pick",
                    vec![QuestionOption { id: "a".into(), label: "A".into() }],
                    false,
                    Some(Duration::from_secs(60)),
                )
                .await
                .unwrap()
        }
    });
    for _ in 0..200 {
        if rig.interactions.has_open_question(&"T1".into()).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    rig.router
        .handle(message_event("T1", "m1", "user9", "none of these"))
        .await
        .unwrap();

    assert_eq!(
        ask.await.unwrap(),
        bridgebot::interaction::QuestionReply::Text("none of these".to_owned())
    );
    assert!(rig.delivery.messages().is_empty(), "question text must not reach the IDE");
}

#[tokio::test]
async fn manual_archive_sets_explicit_flag_and_survives_reopen() {
    let rig = build();
    let now = now_ms();
    rig.registry.insert_mapping(&mapping("C1", "T1", now)).unwrap();
    rig.chat.add_thread("T1", "demo", false);

    // Local activity ten minutes ago, then the user archives the
    // thread: far inside the 1435-minute detection threshold.
    rig.registry.record_activity(&"T1".into(), now - 10 * 60_000).unwrap();
    rig.chat.state.lock().unwrap().threads.get_mut(&"T1".into()).unwrap().archived = true;
    rig.router
        .handle(thread_update_event("T1", true, 1440))
        .await
        .unwrap();
    assert!(rig.registry.is_explicitly_archived(&"T1".into()).unwrap());

    // The reopener respects the explicit flag.
    let source = MockSource::new();
    source.set_ranked(vec![("C1", Some(now))]);
    let watcher = Arc::new(ChatWatcher::new(
        Arc::clone(&rig.chat) as _,
        Arc::clone(&source) as _,
        Arc::clone(&rig.registry),
        Arc::new(PendingComposer::new()),
        Arc::new(ArcSwap::from_pointee(RuntimeConfig::default())),
    ));
    assert_eq!(watcher.reopen_active_threads().await.unwrap(), 0);
    assert!(rig.chat.thread("T1").archived);

    // A new inbound message clears the flag; the next reopen pass may
    // reopen the thread.
    rig.router
        .handle(message_event("T1", "m9", "user9", "wake up"))
        .await
        .unwrap();
    assert!(!rig.registry.is_explicitly_archived(&"T1".into()).unwrap());
    assert_eq!(watcher.reopen_active_threads().await.unwrap(), 1);
    assert!(!rig.chat.thread("T1").archived);
}

#[tokio::test]
async fn inactivity_archive_leaves_no_explicit_flag() {
    let rig = build();
    let now = now_ms();
    rig.registry.insert_mapping(&mapping("C1", "T1", now)).unwrap();
    rig.chat.add_thread("T1", "demo", true);

    // Last activity 1436 minutes ago: past the detection threshold.
    rig.registry
        .record_activity(&"T1".into(), now - 1_436 * 60_000)
        .unwrap();
    rig.router
        .handle(thread_update_event("T1", true, 1440))
        .await
        .unwrap();

    assert!(!rig.registry.is_explicitly_archived(&"T1".into()).unwrap());
}

#[tokio::test]
async fn unarchive_transition_clears_explicit_flag() {
    let rig = build();
    let now = now_ms();
    rig.registry.insert_mapping(&mapping("C1", "T1", now)).unwrap();
    rig.chat.add_thread("T1", "demo", false);

    rig.registry.record_activity(&"T1".into(), now - 60_000).unwrap();
    rig.router.handle(thread_update_event("T1", true, 1440)).await.unwrap();
    assert!(rig.registry.is_explicitly_archived(&"T1".into()).unwrap());

    rig.router.handle(thread_update_event("T1", false, 1440)).await.unwrap();
    assert!(!rig.registry.is_explicitly_archived(&"T1".into()).unwrap());
}

#[tokio::test]
async fn button_interaction_routes_to_question() {
    let rig = build();
    rig.registry.insert_mapping(&mapping("C1", "T1", now_ms())).unwrap();
    rig.chat.add_thread("T1", "demo", false);

    let ask = tokio::spawn({
        let interactions = Arc::clone(&rig.interactions);
        async move {
            interactions
                .ask(
                    &"T1".into(),
                    "Go?",
                    vec![QuestionOption { id: "yes".into(), label: "Yes".into() }],
                    false,
                    Some(Duration::from_secs(60)),
                )
                .await
                .unwrap()
        }
    });
    for _ in 0..200 {
        if rig.interactions.has_open_question(&"T1".into()).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let message_id = rig.chat.thread("T1").plain.last().unwrap().0.clone();

    rig.router
        .handle(WireEvent::Dispatch {
            name: "INTERACTION_CREATE".into(),
            payload: json!({
                "type": 3,
                "id": "I1",
                "token": "tok",
                "data": { "custom_id": format!("q:{message_id}:yes") },
            }),
        })
        .await
        .unwrap();

    assert_eq!(
        ask.await.unwrap(),
        bridgebot::interaction::QuestionReply::Options(vec!["yes".into()])
    );
}
