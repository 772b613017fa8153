//! The Message Log: durable, observable message history per conversation.
//!
//! Every message is visible from two sides.  The owner side is what the
//! user sees under `chats/<user>/<character>`; the counterpart side is the
//! mirrored copy under `chats/<character>/<user>`.  Deleting "for me" hides
//! the owner copy only, deleting "for everyone" hides both.

use std::sync::Arc;

use async_trait::async_trait;
use charlink_shared::message::chronological;
use charlink_shared::{ConversationKey, Message, MessageId};
use tokio::sync::watch;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// Hide the message from the owner's view only.
    Owner,
    /// Hide the message from both views.
    Everyone,
}

impl DeleteScope {
    pub fn for_everyone(flag: bool) -> Self {
        if flag {
            Self::Everyone
        } else {
            Self::Owner
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSide {
    Owner,
    Counterpart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

impl SnapshotOrder {
    /// Arrange a chronologically sorted list in this order.
    pub fn arrange(self, mut oldest_first: Vec<Message>) -> Vec<Message> {
        if self == Self::NewestFirst {
            oldest_first.reverse();
        }
        oldest_first
    }
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Store `message` under `key` on both sides.  The returned message is
    /// the stored record (its `conversation` is rewritten to `key`).
    async fn append(&self, key: &ConversationKey, message: Message) -> Result<Message>;

    /// Hide a message.  Returns `false` when nothing was visible to remove.
    async fn remove(&self, key: &ConversationKey, id: MessageId, scope: DeleteScope)
        -> Result<bool>;

    /// Live owner-side view of `key`.  The first snapshot is available
    /// immediately; later snapshots replace it wholesale.
    async fn subscribe(
        &self,
        key: &ConversationKey,
        order: SnapshotOrder,
    ) -> Result<MessageSubscription>;

    /// One-shot read of either side.
    async fn snapshot(
        &self,
        key: &ConversationKey,
        side: ViewSide,
        order: SnapshotOrder,
    ) -> Result<Vec<Message>>;
}

/// Sorted oldest-first, as published by the stores.
pub type SharedSnapshot = Arc<[Message]>;

pub(crate) fn shared_snapshot(messages: &[Message]) -> SharedSnapshot {
    Arc::from(chronological(messages))
}

/// Handle to a live conversation.  Dropping it ends the subscription.
#[derive(Debug)]
pub struct MessageSubscription {
    rx: watch::Receiver<SharedSnapshot>,
    order: SnapshotOrder,
}

impl MessageSubscription {
    pub fn new(rx: watch::Receiver<SharedSnapshot>, order: SnapshotOrder) -> Self {
        Self { rx, order }
    }

    pub fn order(&self) -> SnapshotOrder {
        self.order
    }

    /// The latest snapshot, marking it as seen.
    pub fn current(&mut self) -> SharedSnapshot {
        let snapshot = self.rx.borrow_and_update().clone();
        self.arrange(snapshot)
    }

    /// Wait for the next snapshot.  Intermediate snapshots published while
    /// the caller was busy are skipped.
    pub async fn changed(&mut self) -> Result<SharedSnapshot> {
        self.rx.changed().await.map_err(|_| StoreError::Closed)?;
        Ok(self.current())
    }

    fn arrange(&self, snapshot: SharedSnapshot) -> SharedSnapshot {
        match self.order {
            SnapshotOrder::OldestFirst => snapshot,
            SnapshotOrder::NewestFirst => snapshot.iter().rev().cloned().collect(),
        }
    }
}
