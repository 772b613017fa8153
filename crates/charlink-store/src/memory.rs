//! In-process Persona Store and Message Log.
//!
//! Used by the server's default `memory` backend and by tests.  Nothing
//! survives a restart.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use charlink_shared::{Character, CharacterFilter, CharacterId, ConversationKey, Counter, Message, MessageId};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::hub::SnapshotHub;
use crate::log::{
    shared_snapshot, DeleteScope, MessageLog, MessageSubscription, SharedSnapshot, SnapshotOrder,
    ViewSide,
};
use crate::personas::{prepare_for_put, CharacterSubscription, PersonaStore};

#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    owner_visible: bool,
    counterpart_visible: bool,
}

impl StoredMessage {
    fn visible_on(&self, side: ViewSide) -> bool {
        match side {
            ViewSide::Owner => self.owner_visible,
            ViewSide::Counterpart => self.counterpart_visible,
        }
    }
}

#[derive(Default)]
struct Inner {
    characters: HashMap<CharacterId, Character>,
    conversations: HashMap<ConversationKey, Vec<StoredMessage>>,
}

impl Inner {
    fn side(&self, key: &ConversationKey, side: ViewSide) -> Vec<Message> {
        self.conversations
            .get(key)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|s| s.visible_on(side))
                    .map(|s| s.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn owner_snapshot(&self, key: &ConversationKey) -> SharedSnapshot {
        shared_snapshot(&self.side(key, ViewSide::Owner))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    conversations: SnapshotHub<ConversationKey, SharedSnapshot>,
    characters: SnapshotHub<CharacterId, Option<Character>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageLog for MemoryStore {
    async fn append(&self, key: &ConversationKey, mut message: Message) -> Result<Message> {
        message.conversation = key.clone();

        let mut inner = self.lock();
        inner
            .conversations
            .entry(key.clone())
            .or_default()
            .push(StoredMessage {
                message: message.clone(),
                owner_visible: true,
                counterpart_visible: true,
            });

        debug!(conversation = %key, message_id = %message.id, "message appended");
        self.conversations.publish(key, inner.owner_snapshot(key));
        Ok(message)
    }

    async fn remove(
        &self,
        key: &ConversationKey,
        id: MessageId,
        scope: DeleteScope,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(stored) = inner.conversations.get_mut(key) else {
            return Ok(false);
        };
        let Some(pos) = stored.iter().position(|s| s.message.id == id) else {
            return Ok(false);
        };

        let entry = &mut stored[pos];
        let changed = match scope {
            DeleteScope::Owner => std::mem::replace(&mut entry.owner_visible, false),
            DeleteScope::Everyone => {
                let was_visible = entry.owner_visible || entry.counterpart_visible;
                entry.owner_visible = false;
                entry.counterpart_visible = false;
                was_visible
            }
        };
        if !entry.owner_visible && !entry.counterpart_visible {
            stored.remove(pos);
        }

        if changed {
            debug!(conversation = %key, message_id = %id, ?scope, "message removed");
            self.conversations.publish(key, inner.owner_snapshot(key));
        }
        Ok(changed)
    }

    async fn subscribe(
        &self,
        key: &ConversationKey,
        order: SnapshotOrder,
    ) -> Result<MessageSubscription> {
        let inner = self.lock();
        let rx = self.conversations.subscribe(key, inner.owner_snapshot(key));
        Ok(MessageSubscription::new(rx, order))
    }

    async fn snapshot(
        &self,
        key: &ConversationKey,
        side: ViewSide,
        order: SnapshotOrder,
    ) -> Result<Vec<Message>> {
        let inner = self.lock();
        let messages = charlink_shared::message::chronological(&inner.side(key, side));
        Ok(order.arrange(messages))
    }
}

#[async_trait]
impl PersonaStore for MemoryStore {
    async fn get(&self, id: &CharacterId) -> Result<Option<Character>> {
        Ok(self.lock().characters.get(id).cloned())
    }

    async fn query(&self, filter: &CharacterFilter, limit: usize) -> Result<Vec<Character>> {
        let inner = self.lock();
        Ok(filter.apply(inner.characters.values().cloned(), limit))
    }

    async fn put(&self, character: Character) -> Result<Character> {
        let character = prepare_for_put(character)?;

        let mut inner = self.lock();
        inner
            .characters
            .insert(character.id.clone(), character.clone());
        self.characters
            .publish(&character.id, Some(character.clone()));
        Ok(character)
    }

    async fn subscribe(&self, id: &CharacterId) -> Result<CharacterSubscription> {
        let inner = self.lock();
        let rx = self
            .characters
            .subscribe(id, inner.characters.get(id).cloned());
        Ok(CharacterSubscription::new(rx))
    }

    async fn increment(&self, id: &CharacterId, counter: Counter) -> Result<()> {
        let mut inner = self.lock();
        let character = inner.characters.get_mut(id).ok_or(StoreError::NotFound)?;
        character.increment(counter);
        let updated = character.clone();
        self.characters.publish(id, Some(updated));
        Ok(())
    }
}
