use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use charlink_client::{
    ConversationError, ConversationOrchestrator, ConversationView, ErrorKind, Operation,
    OrchestratorConfig, Phase,
};
use charlink_net::{BackendError, CompletionStream, GenerativeBackend};
use charlink_prompt::assembler::{CURRENT_MESSAGE_LABEL, HISTORY_LABEL};
use charlink_prompt::SystemInstructionTemplate;
use charlink_shared::message::chronological;
use charlink_shared::{CharacterId, ConversationKey, Message, MessageId, SenderRole, UserId};
use charlink_store::{
    DeleteScope, MemoryStore, MessageLog, MessageSubscription, SharedSnapshot, SnapshotOrder,
    StoreError, ViewSide,
};
use chrono::Utc;
use futures::stream;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Subscribe {
        character: String,
        /// Characters whose earlier subscriptions were still open.
        still_open: Vec<String>,
    },
    Append {
        character: String,
        sender: SenderRole,
        text: String,
    },
    Remove {
        character: String,
        scope: DeleteScope,
    },
    Complete {
        prompt: String,
    },
}

type Journal = Arc<Mutex<Vec<Event>>>;

/// Message Log that records every call, stores through a [`MemoryStore`]
/// and publishes snapshots over its own channels so tests can see when a
/// subscription is dropped.
struct RecordingLog {
    journal: Journal,
    store: MemoryStore,
    channels: Mutex<Vec<(ConversationKey, watch::Sender<SharedSnapshot>)>>,
    fail_subscribe: AtomicBool,
    fail_user_append: AtomicBool,
    fail_persona_append: AtomicBool,
}

impl RecordingLog {
    fn new(journal: Journal) -> Self {
        Self {
            journal,
            store: MemoryStore::new(),
            channels: Mutex::new(Vec::new()),
            fail_subscribe: AtomicBool::new(false),
            fail_user_append: AtomicBool::new(false),
            fail_persona_append: AtomicBool::new(false),
        }
    }

    /// Insert without recording, as if written by an earlier session.
    async fn seed(&self, key: &ConversationKey, messages: Vec<Message>) {
        for m in messages {
            self.store.append(key, m).await.unwrap();
        }
        self.publish(key).await;
    }

    /// Append from "another device": recorded nowhere, published normally.
    async fn external_append(&self, key: &ConversationKey, message: Message) {
        self.seed(key, vec![message]).await;
    }

    async fn owner_snapshot(&self, key: &ConversationKey) -> SharedSnapshot {
        let messages = self
            .store
            .snapshot(key, ViewSide::Owner, SnapshotOrder::OldestFirst)
            .await
            .unwrap();
        Arc::from(messages)
    }

    async fn publish(&self, key: &ConversationKey) {
        let snapshot = self.owner_snapshot(key).await;
        let channels = self.channels.lock().unwrap();
        for (k, tx) in channels.iter() {
            if k == key {
                let _ = tx.send(snapshot.clone());
            }
        }
    }

    /// Drop every sender, ending all live subscriptions with an error.
    fn close_channels(&self) {
        self.channels.lock().unwrap().clear();
    }

    fn open_channels(&self) -> Vec<String> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(k, _)| k.character_id.to_string())
            .collect()
    }

    fn record(&self, event: Event) {
        self.journal.lock().unwrap().push(event);
    }
}

#[async_trait]
impl MessageLog for RecordingLog {
    async fn append(&self, key: &ConversationKey, message: Message) -> Result<Message, StoreError> {
        self.record(Event::Append {
            character: key.character_id.to_string(),
            sender: message.sender,
            text: message.text.clone(),
        });
        let failing = match message.sender {
            SenderRole::User => &self.fail_user_append,
            SenderRole::Persona => &self.fail_persona_append,
        };
        if failing.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("write refused".into()));
        }
        let stored = self.store.append(key, message).await?;
        self.publish(key).await;
        Ok(stored)
    }

    async fn remove(
        &self,
        key: &ConversationKey,
        id: MessageId,
        scope: DeleteScope,
    ) -> Result<bool, StoreError> {
        self.record(Event::Remove {
            character: key.character_id.to_string(),
            scope,
        });
        let removed = self.store.remove(key, id, scope).await?;
        self.publish(key).await;
        Ok(removed)
    }

    async fn subscribe(
        &self,
        key: &ConversationKey,
        order: SnapshotOrder,
    ) -> Result<MessageSubscription, StoreError> {
        self.record(Event::Subscribe {
            character: key.character_id.to_string(),
            still_open: self.open_channels(),
        });
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let (tx, rx) = watch::channel(self.owner_snapshot(key).await);
        self.channels.lock().unwrap().push((key.clone(), tx));
        Ok(MessageSubscription::new(rx, order))
    }

    async fn snapshot(
        &self,
        key: &ConversationKey,
        side: ViewSide,
        order: SnapshotOrder,
    ) -> Result<Vec<Message>, StoreError> {
        self.store.snapshot(key, side, order).await
    }
}

enum Script {
    Reply(String),
    Fail,
    Chunks(Vec<String>),
}

struct ScriptedBackend {
    journal: Journal,
    script: Mutex<VecDeque<Script>>,
}

impl ScriptedBackend {
    fn new(journal: Journal) -> Self {
        Self {
            journal,
            script: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, step: Script) {
        self.script.lock().unwrap().push_back(step);
    }

    fn next(&self, prompt: &str) -> Script {
        self.journal.lock().unwrap().push(Event::Complete {
            prompt: prompt.to_string(),
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Fail)
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    async fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        match self.next(prompt) {
            Script::Reply(text) => Ok(text),
            Script::Chunks(chunks) => Ok(chunks.concat()),
            Script::Fail => Err(BackendError::Api {
                status: 503,
                body: "unavailable".into(),
            }),
        }
    }

    async fn complete_streaming(&self, prompt: &str) -> Result<CompletionStream, BackendError> {
        let chunks = match self.next(prompt) {
            Script::Reply(text) => vec![text],
            Script::Chunks(chunks) => chunks,
            Script::Fail => {
                return Err(BackendError::Api {
                    status: 503,
                    body: "unavailable".into(),
                })
            }
        };
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    journal: Journal,
    log: Arc<RecordingLog>,
    backend: Arc<ScriptedBackend>,
    orchestrator: ConversationOrchestrator,
}

fn user() -> UserId {
    UserId::new("u1")
}

fn cid(id: &str) -> CharacterId {
    CharacterId::new(id)
}

fn key(character: &str) -> ConversationKey {
    ConversationKey::new(user(), cid(character))
}

fn harness() -> Harness {
    harness_with(OrchestratorConfig::default())
}

fn harness_with(config: OrchestratorConfig) -> Harness {
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(RecordingLog::new(journal.clone()));
    let backend = Arc::new(ScriptedBackend::new(journal.clone()));
    let orchestrator = ConversationOrchestrator::new(
        user(),
        log.clone(),
        backend.clone(),
        SystemInstructionTemplate::new(),
        config,
    );
    Harness {
        journal,
        log,
        backend,
        orchestrator,
    }
}

impl Harness {
    fn events(&self) -> Vec<Event> {
        self.journal.lock().unwrap().clone()
    }

    fn appends(&self) -> Vec<(SenderRole, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Append { sender, text, .. } => Some((sender, text)),
                _ => None,
            })
            .collect()
    }

    fn prompts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Complete { prompt } => Some(prompt),
                _ => None,
            })
            .collect()
    }

    fn subscribes(&self) -> Vec<(String, Vec<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Subscribe {
                    character,
                    still_open,
                } => Some((character, still_open)),
                _ => None,
            })
            .collect()
    }

    async fn wait_for(&self, pred: impl Fn(&ConversationView) -> bool) -> ConversationView {
        let mut rx = self.orchestrator.watch();
        let view = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| pred(v)))
            .await
            .expect("timed out waiting for view")
            .expect("view channel closed")
            .clone();
        view
    }
}

fn seeded(character: &str, n: usize) -> Vec<Message> {
    let start = Utc::now() - chrono::Duration::hours(1);
    (0..n)
        .map(|i| {
            let mut m = if i % 2 == 0 {
                Message::from_user(key(character), format!("earlier {i}"))
            } else {
                Message::from_persona(key(character), format!("reply {i}"))
            };
            m.timestamp = start + chrono::Duration::seconds(i as i64);
            m
        })
        .collect()
}

fn history_block(prompt: &str) -> Vec<String> {
    let Some(start) = prompt.find(HISTORY_LABEL) else {
        return Vec::new();
    };
    let body = &prompt[start + HISTORY_LABEL.len()..];
    let end = body.find(CURRENT_MESSAGE_LABEL).unwrap_or(body.len());
    body[..end]
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blank_message_is_rejected_without_touching_the_log() {
    let h = harness();
    h.orchestrator
        .start_conversation(&cid("char1"), None)
        .await
        .unwrap();

    for text in ["", "   ", "\n\t"] {
        let err = h
            .orchestrator
            .send_message(text, &cid("char1"), true)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    assert!(h.appends().is_empty());
    assert!(h.prompts().is_empty());
    let error = h.orchestrator.view().error.unwrap();
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(error.operation, Operation::SendMessage);
    assert_eq!(error.message, "Message cannot be empty");
}

#[tokio::test]
async fn blank_character_id_is_rejected_everywhere() {
    let h = harness();
    let blank = cid(" ");

    assert!(h
        .orchestrator
        .start_conversation(&blank, None)
        .await
        .unwrap_err()
        .is_validation());
    assert!(h
        .orchestrator
        .send_message("hi", &blank, false)
        .await
        .unwrap_err()
        .is_validation());
    assert!(h
        .orchestrator
        .delete_message(&blank, MessageId::new(), false)
        .await
        .unwrap_err()
        .is_validation());

    assert!(h.events().is_empty());
    assert_eq!(h.orchestrator.view().phase, Phase::Idle);
}

// ---------------------------------------------------------------------------
// Subscription lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn starting_twice_with_same_id_subscribes_once() {
    let h = harness();
    h.orchestrator
        .start_conversation(&cid("A"), Some("first".into()))
        .await
        .unwrap();
    h.orchestrator
        .start_conversation(&cid("A"), Some("second".into()))
        .await
        .unwrap();

    assert_eq!(h.subscribes().len(), 1);
    assert_eq!(h.orchestrator.current_character(), Some(cid("A")));
}

#[tokio::test]
async fn restarting_same_character_keeps_the_new_persona() {
    let h = harness();
    h.orchestrator
        .start_conversation(&cid("A"), Some("Persona one".into()))
        .await
        .unwrap();
    h.orchestrator
        .start_conversation(&cid("A"), Some("Persona two".into()))
        .await
        .unwrap();
    h.backend.push(Script::Reply("ok".into()));

    h.orchestrator.send_message("hi", &cid("A"), true).await.unwrap();

    let prompt = h.prompts().pop().unwrap();
    assert!(prompt.contains("Persona two"));
    assert!(!prompt.contains("Persona one"));
    assert_eq!(h.subscribes().len(), 1);
}

#[tokio::test]
async fn lost_subscription_is_reopened_by_start() {
    let h = harness();
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    h.log.close_channels();
    let view = h.wait_for(|v| v.error.is_some()).await;
    let error = view.error.unwrap();
    assert_eq!(error.operation, Operation::Listen);
    assert_eq!(error.kind, ErrorKind::Transport);
    assert_eq!(view.phase, Phase::Idle);
    assert_eq!(h.orchestrator.current_character(), None);

    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();
    assert_eq!(h.subscribes().len(), 2);
    assert_eq!(h.orchestrator.current_character(), Some(cid("c")));

    h.log
        .external_append(&key("c"), Message::from_persona(key("c"), "back"))
        .await;
    let view = h.wait_for(|v| v.messages.len() == 1).await;
    assert_eq!(view.messages[0].text, "back");
}

#[tokio::test]
async fn switching_character_cancels_previous_subscription_first() {
    let h = harness();
    h.log.seed(&key("A"), seeded("A", 2)).await;
    h.log.seed(&key("B"), seeded("B", 3)).await;

    h.orchestrator.start_conversation(&cid("A"), None).await.unwrap();
    assert_eq!(h.orchestrator.view().messages.len(), 2);

    h.orchestrator.start_conversation(&cid("B"), None).await.unwrap();

    let subscribes = h.subscribes();
    assert_eq!(subscribes.len(), 2);
    assert_eq!(subscribes[0], ("A".to_string(), vec![]));
    assert_eq!(subscribes[1], ("B".to_string(), vec![]));

    let view = h.orchestrator.view();
    assert_eq!(
        view.phase,
        Phase::Subscribed {
            character_id: cid("B")
        }
    );
    assert_eq!(view.messages.len(), 3);
    assert!(view
        .messages
        .iter()
        .all(|m| m.conversation.character_id == cid("B")));

    // Traffic on A no longer reaches the view.
    h.log
        .external_append(&key("A"), Message::from_persona(key("A"), "stale"))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h
        .orchestrator
        .view()
        .messages
        .iter()
        .all(|m| m.text != "stale"));
}

#[tokio::test]
async fn live_updates_replace_the_message_list() {
    let h = harness();
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();
    assert!(h.orchestrator.view().messages.is_empty());

    h.log
        .external_append(&key("c"), Message::from_persona(key("c"), "ping"))
        .await;

    let view = h.wait_for(|v| v.messages.len() == 1).await;
    assert_eq!(view.messages[0].text, "ping");
}

#[tokio::test]
async fn view_uses_configured_order() {
    let h = harness_with(OrchestratorConfig {
        order: SnapshotOrder::OldestFirst,
        ..Default::default()
    });
    h.log.seed(&key("c"), seeded("c", 3)).await;
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let texts: Vec<String> = h
        .orchestrator
        .view()
        .messages
        .iter()
        .map(|m| m.text.clone())
        .collect();
    assert_eq!(texts, vec!["earlier 0", "reply 1", "earlier 2"]);

    let newest = harness();
    newest.log.seed(&key("c"), seeded("c", 3)).await;
    newest
        .orchestrator
        .start_conversation(&cid("c"), None)
        .await
        .unwrap();
    assert_eq!(newest.orchestrator.view().messages[0].text, "earlier 2");
}

#[tokio::test]
async fn failed_subscribe_stays_idle_and_can_be_retried() {
    let h = harness();
    h.log.fail_subscribe.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .start_conversation(&cid("c"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::Subscribe(_)));
    let view = h.orchestrator.view();
    assert_eq!(view.phase, Phase::Idle);
    assert!(view.messages.is_empty());
    assert_eq!(view.error.unwrap().kind, ErrorKind::Transport);

    h.log.fail_subscribe.store(false, Ordering::SeqCst);
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();
    assert_eq!(h.subscribes().len(), 2);
    assert!(h.orchestrator.view().is_subscribed());
}

#[tokio::test]
async fn shutdown_closes_the_subscription() {
    let h = harness();
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();
    assert_eq!(h.log.open_channels(), vec!["c".to_string()]);

    h.orchestrator.shutdown().await;
    assert!(h.log.open_channels().is_empty());
    assert_eq!(h.orchestrator.view().phase, Phase::Idle);
}

#[tokio::test]
async fn dropping_the_orchestrator_releases_the_listener() {
    let h = harness();
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();
    let log = h.log.clone();
    drop(h);

    tokio::time::timeout(Duration::from_secs(2), async {
        while !log.open_channels().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener still subscribed after drop");
}

// ---------------------------------------------------------------------------
// Sending and replies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_scenario_appends_user_then_calls_backend_then_appends_reply() {
    let h = harness();
    h.backend.push(Script::Reply("Hi there!".into()));
    h.orchestrator
        .start_conversation(&cid("char1"), Some("You are a cheerful robot.".into()))
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .send_message("Hello", &cid("char1"), true)
        .await
        .unwrap();
    assert_eq!(outcome.message.text, "Hello");
    assert_eq!(outcome.reply.as_ref().map(|m| m.text.as_str()), Some("Hi there!"));

    let sequence: Vec<Event> = h
        .events()
        .into_iter()
        .filter(|e| !matches!(e, Event::Subscribe { .. }))
        .collect();
    assert_eq!(sequence.len(), 3);
    assert_eq!(
        sequence[0],
        Event::Append {
            character: "char1".into(),
            sender: SenderRole::User,
            text: "Hello".into()
        }
    );
    match &sequence[1] {
        Event::Complete { prompt } => {
            assert!(prompt.contains("You are a cheerful robot."));
            assert!(prompt.contains("Hello"));
        }
        other => panic!("expected backend call, got {other:?}"),
    }
    assert_eq!(
        sequence[2],
        Event::Append {
            character: "char1".into(),
            sender: SenderRole::Persona,
            text: "Hi there!".into()
        }
    );

    let view = h.wait_for(|v| v.messages.len() == 2).await;
    assert!(view.error.is_none());
    assert!(!view.pending_reply);
    assert!(!view.is_loading);
}

#[tokio::test]
async fn backend_failure_keeps_user_message_and_reports_transport_error() {
    let h = harness();
    h.backend.push(Script::Fail);
    h.orchestrator
        .start_conversation(&cid("char1"), Some("You are a cheerful robot.".into()))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .send_message("Hello", &cid("char1"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::Generation(_)));
    assert!(!err.is_validation());

    assert_eq!(h.appends(), vec![(SenderRole::User, "Hello".to_string())]);
    let stored = h
        .log
        .snapshot(&key("char1"), ViewSide::Owner, SnapshotOrder::OldestFirst)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_from_user());

    let error = h.orchestrator.view().error.unwrap();
    assert_eq!(error.kind, ErrorKind::Transport);
    assert!(error.message.starts_with("AI Error"));
}

#[tokio::test]
async fn blank_completion_is_an_empty_result() {
    let h = harness();
    h.backend.push(Script::Reply("  \n".into()));
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let err = h
        .orchestrator
        .send_message("Hello", &cid("c"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::EmptyCompletion));
    assert_eq!(err.kind(), ErrorKind::EmptyResult);
    assert_eq!(h.appends().len(), 1);
}

#[tokio::test]
async fn failing_to_save_reply_is_reported_and_keeps_user_message() {
    let h = harness();
    h.backend.push(Script::Reply("Hi there!".into()));
    h.log.fail_persona_append.store(true, Ordering::SeqCst);
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let err = h
        .orchestrator
        .send_message("Hello", &cid("c"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::SaveReply(_)));

    let stored = h
        .log
        .snapshot(&key("c"), ViewSide::Owner, SnapshotOrder::OldestFirst)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text, "Hello");
}

#[tokio::test]
async fn failed_user_append_skips_the_backend() {
    let h = harness();
    h.log.fail_user_append.store(true, Ordering::SeqCst);
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let err = h
        .orchestrator
        .send_message("Hello", &cid("c"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::Send(_)));
    assert!(h.prompts().is_empty());
    assert!(!h.orchestrator.view().is_loading);
}

#[tokio::test]
async fn send_without_reply_does_not_call_backend() {
    let h = harness();
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let outcome = h
        .orchestrator
        .send_message("  just saying  ", &cid("c"), false)
        .await
        .unwrap();
    assert_eq!(outcome.message.text, "just saying");
    assert!(outcome.reply.is_none());
    assert!(h.prompts().is_empty());
}

#[tokio::test]
async fn history_holds_latest_window_in_chronological_order() {
    let h = harness();
    let prior = seeded("c", 12);
    let expected: Vec<String> = chronological(&prior)[2..]
        .iter()
        .map(Message::history_line)
        .collect();
    h.log.seed(&key("c"), prior).await;
    h.backend.push(Script::Reply("ok".into()));

    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();
    assert_eq!(h.orchestrator.view().messages.len(), 12);

    h.orchestrator
        .send_message("next", &cid("c"), true)
        .await
        .unwrap();

    let prompt = h.prompts().pop().unwrap();
    let history = history_block(&prompt);
    assert_eq!(history.len(), 10);
    assert_eq!(history, expected);
    assert!(!history.iter().any(|l| l.ends_with(": next")));
    assert!(prompt.ends_with("next"));
}

#[tokio::test]
async fn history_window_is_configurable() {
    let h = harness_with(OrchestratorConfig {
        history_window: 3,
        ..Default::default()
    });
    h.log.seed(&key("c"), seeded("c", 8)).await;
    h.backend.push(Script::Reply("ok".into()));
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    h.orchestrator.send_message("hey", &cid("c"), true).await.unwrap();
    assert_eq!(history_block(&h.prompts()[0]).len(), 3);
}

#[tokio::test]
async fn reply_for_another_character_uses_no_persona_or_history() {
    let h = harness();
    h.log.seed(&key("A"), seeded("A", 4)).await;
    h.backend.push(Script::Reply("ok".into()));
    h.orchestrator
        .start_conversation(&cid("A"), Some("Persona A".into()))
        .await
        .unwrap();

    h.orchestrator.send_message("hi", &cid("B"), true).await.unwrap();

    let prompt = &h.prompts()[0];
    assert!(!prompt.contains("Persona A"));
    assert!(history_block(prompt).is_empty());
}

#[tokio::test]
async fn template_changes_apply_to_the_next_prompt() {
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(RecordingLog::new(journal.clone()));
    let backend = Arc::new(ScriptedBackend::new(journal.clone()));
    let template = SystemInstructionTemplate::new();
    let orchestrator = ConversationOrchestrator::new(
        user(),
        log,
        backend.clone(),
        template.clone(),
        OrchestratorConfig::default(),
    );
    backend.push(Script::Reply("ok".into()));

    template.set("Only speak in rhymes.").unwrap();
    orchestrator.send_message("hi", &cid("c"), true).await.unwrap();

    let prompts: Vec<String> = journal
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Complete { prompt } => Some(prompt.clone()),
            _ => None,
        })
        .collect();
    assert!(prompts[0].starts_with("Only speak in rhymes."));
}

#[tokio::test]
async fn streaming_reply_is_appended_once_with_full_text() {
    let h = harness();
    h.backend
        .push(Script::Chunks(vec!["Hi ".into(), "there".into(), "!".into()]));
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let outcome = h
        .orchestrator
        .send_message_streaming("Hello", &cid("c"))
        .await
        .unwrap();
    assert_eq!(outcome.reply.unwrap().text, "Hi there!");
    assert_eq!(
        h.appends(),
        vec![
            (SenderRole::User, "Hello".to_string()),
            (SenderRole::Persona, "Hi there!".to_string())
        ]
    );

    let view = h.orchestrator.view();
    assert!(view.partial_reply.is_none());
    assert!(!view.pending_reply);
}

#[tokio::test]
async fn empty_stream_is_an_empty_result() {
    let h = harness();
    h.backend.push(Script::Chunks(Vec::new()));
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let err = h
        .orchestrator
        .send_message_streaming("Hello", &cid("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::EmptyCompletion));
    assert_eq!(h.appends().len(), 1);
}

#[tokio::test]
async fn quick_reply_does_not_trigger_reply_by_default() {
    let h = harness();
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let outcome = h
        .orchestrator
        .send_quick_reply("👍", &cid("c"))
        .await
        .unwrap();
    assert_eq!(outcome.message.text, "👍");
    assert!(outcome.message.is_from_user());
    assert!(h.prompts().is_empty());
}

#[tokio::test]
async fn quick_reply_can_be_configured_to_trigger_reply() {
    let h = harness_with(OrchestratorConfig {
        quick_reply_triggers_reply: true,
        ..Default::default()
    });
    h.backend.push(Script::Reply("😊".into()));
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();

    let outcome = h
        .orchestrator
        .send_quick_reply("👍", &cid("c"))
        .await
        .unwrap();
    assert_eq!(outcome.reply.unwrap().text, "😊");
    assert_eq!(h.prompts().len(), 1);
}

// ---------------------------------------------------------------------------
// Deleting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_for_me_keeps_counterpart_copy() {
    let h = harness();
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();
    let sent = h
        .orchestrator
        .send_message("oops", &cid("c"), false)
        .await
        .unwrap()
        .message;

    assert!(h
        .orchestrator
        .delete_message(&cid("c"), sent.id, false)
        .await
        .unwrap());

    let owner = h
        .log
        .snapshot(&key("c"), ViewSide::Owner, SnapshotOrder::OldestFirst)
        .await
        .unwrap();
    let counterpart = h
        .log
        .snapshot(&key("c"), ViewSide::Counterpart, SnapshotOrder::OldestFirst)
        .await
        .unwrap();
    assert!(owner.is_empty());
    assert_eq!(counterpart.len(), 1);

    h.wait_for(|v| v.messages.is_empty()).await;
}

#[tokio::test]
async fn delete_for_everyone_removes_both_copies() {
    let h = harness();
    h.orchestrator.start_conversation(&cid("c"), None).await.unwrap();
    let sent = h
        .orchestrator
        .send_message("oops", &cid("c"), false)
        .await
        .unwrap()
        .message;

    h.orchestrator
        .delete_message(&cid("c"), sent.id, true)
        .await
        .unwrap();

    assert!(h.events().contains(&Event::Remove {
        character: "c".into(),
        scope: DeleteScope::Everyone
    }));
    for side in [ViewSide::Owner, ViewSide::Counterpart] {
        let messages = h
            .log
            .snapshot(&key("c"), side, SnapshotOrder::OldestFirst)
            .await
            .unwrap();
        assert!(messages.is_empty());
    }
}

#[tokio::test]
async fn clear_error_resets_reported_error() {
    let h = harness();
    let _ = h.orchestrator.send_message("", &cid("c"), false).await;
    assert!(h.orchestrator.view().error.is_some());

    h.orchestrator.clear_error();
    assert!(h.orchestrator.view().error.is_none());
}
