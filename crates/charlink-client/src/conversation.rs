//! Conversation orchestration.
//!
//! A [`ConversationOrchestrator`] owns the live state of one user's active
//! conversation.  It subscribes to the Message Log for the selected
//! character, appends what the user sends, and asks the generative backend
//! for the character's reply.
//!
//! The live subscription is the only writer of `messages` in the view.
//! Sends never insert optimistically; the new message shows up when the
//! log publishes its next snapshot.
//!
//! Switching characters stops the old listener and waits for it to finish
//! before the new subscription is opened.  Each listener also carries the
//! session generation it was started under and every view write re-checks
//! it, so a listener that loses the race with cancellation still cannot
//! write stale messages.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use charlink_net::GenerativeBackend;
use charlink_prompt::{PromptContext, PromptParts, SystemInstructionTemplate};
use charlink_shared::constants::DEFAULT_HISTORY_WINDOW;
use charlink_shared::error::require_text;
use charlink_shared::message::chronological;
use charlink_shared::{CharacterId, ConversationKey, Message, MessageId, UserId, ValidationError};
use charlink_store::{DeleteScope, MessageLog, MessageSubscription, SharedSnapshot, SnapshotOrder};
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConversationError;
use crate::state::{ConversationView, Operation, Phase, ReportedError};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How many earlier messages go into the prompt's history section.
    pub history_window: usize,
    /// Order of `messages` in the published view.
    pub order: SnapshotOrder,
    /// Whether [`ConversationOrchestrator::send_quick_reply`] asks for a
    /// persona reply.
    pub quick_reply_triggers_reply: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_window: DEFAULT_HISTORY_WINDOW,
            order: SnapshotOrder::NewestFirst,
            quick_reply_triggers_reply: false,
        }
    }
}

/// What a successful send stored.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// The persona's reply, when one was requested.
    pub reply: Option<Message>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    view: watch::Sender<ConversationView>,
    generation: AtomicU64,
    in_flight: AtomicUsize,
}

impl Shared {
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Replace the message list, unless the session moved on.
    fn publish_messages(&self, generation: u64, snapshot: SharedSnapshot) -> bool {
        self.view.send_if_modified(|view| {
            if self.current_generation() != generation {
                return false;
            }
            view.messages = snapshot;
            true
        })
    }

    fn set_partial(&self, generation: u64, partial: Option<String>) {
        self.view.send_if_modified(|view| {
            if self.current_generation() != generation {
                return false;
            }
            view.partial_reply = partial;
            true
        });
    }

    fn set_pending(&self, generation: u64, pending: bool) {
        self.view.send_if_modified(|view| {
            if self.current_generation() != generation || view.pending_reply == pending {
                return false;
            }
            view.pending_reply = pending;
            true
        });
    }

    fn report(&self, error: ReportedError) {
        self.view.send_modify(|view| view.error = Some(error));
    }

    /// Report a subscription that ended on its own and drop back to idle,
    /// unless the session moved on.
    fn report_lost(&self, generation: u64, error: ReportedError) -> bool {
        self.view.send_if_modified(|view| {
            if self.current_generation() != generation {
                return false;
            }
            view.phase = Phase::Idle;
            view.error = Some(error);
            true
        })
    }
}

/// Marks the view as loading for as long as it lives.
struct LoadingGuard<'a> {
    shared: &'a Shared,
}

impl<'a> LoadingGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        shared.view.send_if_modified(|view| !std::mem::replace(&mut view.is_loading, true));
        Self { shared }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared
                .view
                .send_if_modified(|view| std::mem::replace(&mut view.is_loading, false));
        }
    }
}

struct Listener {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    /// Cancel and wait until the task (and its subscription) is gone.
    async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }

    fn abort(self) {
        self.token.cancel();
        self.task.abort();
    }

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

#[derive(Default)]
struct Session {
    character: Option<CharacterId>,
    persona: Option<String>,
    listener: Option<Listener>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct ConversationOrchestrator {
    user: UserId,
    log: Arc<dyn MessageLog>,
    backend: Arc<dyn GenerativeBackend>,
    template: SystemInstructionTemplate,
    config: OrchestratorConfig,
    shared: Arc<Shared>,
    session: Mutex<Session>,
}

impl ConversationOrchestrator {
    pub fn new(
        user: UserId,
        log: Arc<dyn MessageLog>,
        backend: Arc<dyn GenerativeBackend>,
        template: SystemInstructionTemplate,
        config: OrchestratorConfig,
    ) -> Self {
        let (view, _rx) = watch::channel(ConversationView::default());
        Self {
            user,
            log,
            backend,
            template,
            config,
            shared: Arc::new(Shared {
                view,
                generation: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
            }),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Current state.
    pub fn view(&self) -> ConversationView {
        self.shared.view.borrow().clone()
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<ConversationView> {
        self.shared.view.subscribe()
    }

    pub fn current_character(&self) -> Option<CharacterId> {
        self.shared.view.borrow().character_id().cloned()
    }

    pub fn clear_error(&self) {
        self.shared
            .view
            .send_if_modified(|view| view.error.take().is_some());
    }

    fn fail(&self, operation: Operation, err: ConversationError) -> ConversationError {
        warn!(user = %self.user, ?operation, error = %err, "conversation operation failed");
        self.shared.report(ReportedError::new(operation, &err));
        err
    }

    fn key(&self, character_id: &CharacterId) -> ConversationKey {
        ConversationKey::new(self.user.clone(), character_id.clone())
    }

    // -----------------------------------------------------------------------
    // Subscription lifecycle
    // -----------------------------------------------------------------------

    /// Subscribe to `character_id`'s messages, replacing any previous
    /// subscription.  When already subscribed to the same id only the
    /// persona is updated.  A subscription that ended with an error is
    /// opened again.
    pub async fn start_conversation(
        &self,
        character_id: &CharacterId,
        persona: Option<String>,
    ) -> Result<(), ConversationError> {
        if character_id.is_blank() {
            let err = ValidationError::Blank("Character id").into();
            return Err(self.fail(Operation::StartConversation, err));
        }

        let mut session = self.session.lock().await;
        let live = session.listener.as_ref().is_some_and(Listener::is_alive)
            && self.current_character().as_ref() == Some(character_id);
        if live && session.character.as_ref() == Some(character_id) {
            session.persona = persona.filter(|p| !p.trim().is_empty());
            debug!(character = %character_id, "already subscribed");
            return Ok(());
        }

        if let Some(listener) = session.listener.take() {
            listener.stop().await;
            debug!(
                character = ?session.character,
                "previous subscription cancelled"
            );
        }

        // Bump first so a listener still running cannot write after the
        // reset below.
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        session.character = None;
        session.persona = persona.filter(|p| !p.trim().is_empty());
        let in_flight = self.shared.in_flight.load(Ordering::SeqCst) > 0;
        self.shared.view.send_modify(|view| {
            *view = ConversationView {
                is_loading: in_flight,
                ..ConversationView::default()
            };
        });

        let key = self.key(character_id);
        let mut subscription = match self.log.subscribe(&key, self.config.order).await {
            Ok(subscription) => subscription,
            Err(e) => {
                session.persona = None;
                return Err(self.fail(Operation::StartConversation, ConversationError::Subscribe(e)));
            }
        };

        self.shared.publish_messages(generation, subscription.current());

        let token = CancellationToken::new();
        let task = tokio::spawn(listen(
            self.shared.clone(),
            subscription,
            generation,
            token.clone(),
            key,
        ));

        session.character = Some(character_id.clone());
        session.listener = Some(Listener { token, task });
        self.shared.view.send_modify(|view| {
            view.phase = Phase::Subscribed {
                character_id: character_id.clone(),
            };
        });

        info!(user = %self.user, character = %character_id, generation, "conversation started");
        Ok(())
    }

    /// Stop listening.  The view keeps its last state but is never written
    /// by the old subscription again.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(listener) = session.listener.take() {
            listener.stop().await;
        }
        session.character = None;
        session.persona = None;
        self.shared.view.send_modify(|view| view.phase = Phase::Idle);
        debug!(user = %self.user, "conversation shut down");
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Append a user message and, when `trigger_reply` is set, the persona's
    /// reply.  A failed reply never removes the user's message.
    pub async fn send_message(
        &self,
        text: &str,
        character_id: &CharacterId,
        trigger_reply: bool,
    ) -> Result<SendOutcome, ConversationError> {
        let op = Operation::SendMessage;
        self.validate_send(op, "Message", text, character_id)?;
        let text = text.trim();
        self.send_validated(op, Message::from_user(self.key(character_id), text), trigger_reply)
            .await
    }

    /// Send an emoji or canned reply.  Whether the persona answers is
    /// [`OrchestratorConfig::quick_reply_triggers_reply`].
    pub async fn send_quick_reply(
        &self,
        emoji: &str,
        character_id: &CharacterId,
    ) -> Result<SendOutcome, ConversationError> {
        let op = Operation::QuickReply;
        self.validate_send(op, "Quick reply", emoji, character_id)?;
        let message = Message::quick_reply(self.key(character_id), emoji.trim());
        self.send_validated(op, message, self.config.quick_reply_triggers_reply)
            .await
    }

    /// As [`send_message`] with a reply, but the reply is streamed: the
    /// partial text is published in the view as it arrives and the persona
    /// message is appended once, complete.
    ///
    /// [`send_message`]: ConversationOrchestrator::send_message
    pub async fn send_message_streaming(
        &self,
        text: &str,
        character_id: &CharacterId,
    ) -> Result<SendOutcome, ConversationError> {
        let op = Operation::SendMessage;
        self.validate_send(op, "Message", text, character_id)?;
        let _loading = LoadingGuard::new(&self.shared);
        self.clear_error();

        let message = self
            .append_user(op, Message::from_user(self.key(character_id), text.trim()))
            .await?;
        let reply = self
            .stream_reply(character_id, &message)
            .await
            .map_err(|e| self.fail(op, e))?;

        Ok(SendOutcome {
            message,
            reply: Some(reply),
        })
    }

    fn validate_send(
        &self,
        op: Operation,
        field: &'static str,
        text: &str,
        character_id: &CharacterId,
    ) -> Result<(), ConversationError> {
        require_text(field, text)
            .and_then(|_| require_text("Character id", character_id.as_str()))
            .map_err(|e| self.fail(op, e.into()))
    }

    async fn send_validated(
        &self,
        op: Operation,
        message: Message,
        trigger_reply: bool,
    ) -> Result<SendOutcome, ConversationError> {
        let _loading = LoadingGuard::new(&self.shared);
        self.clear_error();

        let character_id = message.conversation.character_id.clone();
        let message = self.append_user(op, message).await?;

        let reply = if trigger_reply {
            let reply = self
                .reply(&character_id, &message)
                .await
                .map_err(|e| self.fail(op, e))?;
            Some(reply)
        } else {
            None
        };

        Ok(SendOutcome { message, reply })
    }

    async fn append_user(&self, op: Operation, message: Message) -> Result<Message, ConversationError> {
        let key = message.conversation.clone();
        let stored = self
            .log
            .append(&key, message)
            .await
            .map_err(|e| self.fail(op, ConversationError::Send(e)))?;
        debug!(character = %key.character_id, message_id = %stored.id, "user message appended");
        Ok(stored)
    }

    async fn reply(
        &self,
        character_id: &CharacterId,
        sent: &Message,
    ) -> Result<Message, ConversationError> {
        let context = self.reply_context(character_id, sent).await?;
        let prompt = context.render();
        let generation = self.shared.current_generation();

        debug!(
            character = %character_id,
            prompt_len = prompt.len(),
            history = context.history().len(),
            "requesting completion"
        );

        self.shared.set_pending(generation, true);
        let completion = self.backend.complete(&prompt).await;
        self.shared.set_pending(generation, false);

        let text = completion.map_err(ConversationError::from_backend)?;
        if text.trim().is_empty() {
            return Err(ConversationError::EmptyCompletion);
        }
        self.append_reply(character_id, text).await
    }

    async fn stream_reply(
        &self,
        character_id: &CharacterId,
        sent: &Message,
    ) -> Result<Message, ConversationError> {
        let context = self.reply_context(character_id, sent).await?;
        let prompt = context.render();
        let generation = self.shared.current_generation();

        debug!(character = %character_id, prompt_len = prompt.len(), "requesting streamed completion");

        self.shared.set_pending(generation, true);
        let result = self.collect_stream(generation, &prompt).await;
        self.shared.set_pending(generation, false);
        self.shared.set_partial(generation, None);

        let text = result?;
        if text.trim().is_empty() {
            return Err(ConversationError::EmptyCompletion);
        }
        self.append_reply(character_id, text).await
    }

    async fn collect_stream(&self, generation: u64, prompt: &str) -> Result<String, ConversationError> {
        let mut chunks = self
            .backend
            .complete_streaming(prompt)
            .await
            .map_err(ConversationError::from_backend)?;

        let mut text = String::new();
        while let Some(chunk) = chunks.next().await {
            text.push_str(&chunk.map_err(ConversationError::from_backend)?);
            self.shared.set_partial(generation, Some(text.clone()));
        }
        Ok(text)
    }

    async fn append_reply(
        &self,
        character_id: &CharacterId,
        text: String,
    ) -> Result<Message, ConversationError> {
        let key = self.key(character_id);
        let reply = self
            .log
            .append(&key, Message::from_persona(key.clone(), text))
            .await
            .map_err(ConversationError::SaveReply)?;
        debug!(character = %character_id, message_id = %reply.id, "persona reply appended");
        Ok(reply)
    }

    /// History and persona only apply when the reply is for the character
    /// this session is subscribed to.
    async fn reply_context(
        &self,
        character_id: &CharacterId,
        sent: &Message,
    ) -> Result<PromptContext, ConversationError> {
        let persona = {
            let session = self.session.lock().await;
            match session.character.as_ref() {
                Some(current) if current == character_id => Some(session.persona.clone()),
                _ => None,
            }
        };

        let history = match persona {
            Some(_) => {
                let messages = self.shared.view.borrow().messages.clone();
                recent_history(&messages, Some(sent.id), self.config.history_window)
            }
            None => Vec::new(),
        };

        Ok(PromptContext::new(PromptParts {
            system_instruction: self.template.get().to_string(),
            current_utterance: sent.text.clone(),
            persona: persona.flatten(),
            memories: Vec::new(),
            history,
        })?)
    }

    // -----------------------------------------------------------------------
    // Deleting
    // -----------------------------------------------------------------------

    /// Remove a message from the user's view, and with `for_everyone` from
    /// the character's side too.  `Ok(false)` when there was nothing to
    /// remove.
    pub async fn delete_message(
        &self,
        character_id: &CharacterId,
        message_id: MessageId,
        for_everyone: bool,
    ) -> Result<bool, ConversationError> {
        let op = Operation::DeleteMessage;
        require_text("Character id", character_id.as_str()).map_err(|e| self.fail(op, e.into()))?;

        let _loading = LoadingGuard::new(&self.shared);
        self.clear_error();

        let scope = DeleteScope::for_everyone(for_everyone);
        let removed = self
            .log
            .remove(&self.key(character_id), message_id, scope)
            .await
            .map_err(|e| self.fail(op, ConversationError::Delete(e)))?;

        debug!(character = %character_id, message_id = %message_id, ?scope, removed, "delete");
        Ok(removed)
    }
}

impl Drop for ConversationOrchestrator {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(listener) = self.session.get_mut().listener.take() {
            listener.abort();
        }
    }
}

/// The last `window` messages before `exclude`, oldest first, as prompt
/// history lines.
pub fn recent_history(messages: &[Message], exclude: Option<MessageId>, window: usize) -> Vec<String> {
    let earlier: Vec<Message> = messages
        .iter()
        .filter(|m| Some(m.id) != exclude)
        .cloned()
        .collect();
    let ordered = chronological(&earlier);
    let skip = ordered.len().saturating_sub(window);
    ordered[skip..].iter().map(Message::history_line).collect()
}

async fn listen(
    shared: Arc<Shared>,
    mut subscription: MessageSubscription,
    generation: u64,
    token: CancellationToken,
    key: ConversationKey,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = subscription.changed() => match next {
                Ok(snapshot) => {
                    let count = snapshot.len();
                    if !shared.publish_messages(generation, snapshot) {
                        break;
                    }
                    debug!(conversation = %key, count, "snapshot applied");
                }
                Err(e) => {
                    let err = ConversationError::Subscribe(e);
                    if shared.report_lost(generation, ReportedError::new(Operation::Listen, &err)) {
                        warn!(conversation = %key, error = %err, "subscription ended");
                    }
                    break;
                }
            },
        }
    }
    debug!(conversation = %key, generation, "listener stopped");
}
