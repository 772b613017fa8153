//! Chat message model.
//!
//! Messages are immutable once written; an edit is a delete followed by a
//! new message.  The persona-authored side of a conversation is always
//! produced by the orchestrator, never typed by a human.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationKey, MessageId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    User,
    Persona,
}

impl SenderRole {
    /// Prefix used when the message is rendered into prompt history.
    pub fn prompt_label(&self) -> &'static str {
        match self {
            SenderRole::User => "User",
            SenderRole::Persona => "Character",
        }
    }
}

/// Delivery status.  Informational only; nothing in the core gates on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationKey,
    pub text: String,
    pub sender: SenderRole,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub reactions: Vec<String>,
}

impl Message {
    pub fn new(conversation: ConversationKey, sender: SenderRole, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            conversation,
            text: text.into(),
            sender,
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
            reactions: Vec::new(),
        }
    }

    pub fn from_user(conversation: ConversationKey, text: impl Into<String>) -> Self {
        Self::new(conversation, SenderRole::User, text)
    }

    pub fn from_persona(conversation: ConversationKey, text: impl Into<String>) -> Self {
        Self::new(conversation, SenderRole::Persona, text)
    }

    pub fn quick_reply(conversation: ConversationKey, emoji: impl Into<String>) -> Self {
        Self::new(conversation, SenderRole::User, emoji)
    }

    pub fn is_from_user(&self) -> bool {
        self.sender == SenderRole::User
    }

    pub fn is_from_persona(&self) -> bool {
        self.sender == SenderRole::Persona
    }

    /// `HH:MM` in UTC.
    pub fn formatted_time(&self) -> String {
        self.timestamp.format("%H:%M").to_string()
    }

    /// `Today`, `Yesterday`, or `dd/mm/yyyy`, relative to `now`.
    pub fn day_label(&self, now: DateTime<Utc>) -> String {
        let day = self.timestamp.date_naive();
        let today = now.date_naive();
        if day == today {
            "Today".to_string()
        } else if day == today - Duration::days(1) {
            "Yesterday".to_string()
        } else {
            self.timestamp.format("%d/%m/%Y").to_string()
        }
    }

    /// Line rendered into the prompt's conversation history block.
    pub fn history_line(&self) -> String {
        format!("{}: {}", self.sender.prompt_label(), self.text)
    }

    /// Total order used whenever snapshots are sorted: timestamp, then id.
    pub fn chronological_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

// ---------------------------------------------------------------------------
// Snapshot helpers
// ---------------------------------------------------------------------------

/// Copy of `messages` sorted oldest first.
pub fn chronological(messages: &[Message]) -> Vec<Message> {
    let mut sorted = messages.to_vec();
    sorted.sort_by(Message::chronological_cmp);
    sorted
}

/// Persona-authored messages that have not been read.
pub fn unread_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| m.is_from_persona() && m.status != MessageStatus::Read)
        .count()
}

/// Copy of `messages` with every persona-authored message marked read.
pub fn mark_all_read(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .cloned()
        .map(|mut m| {
            if m.is_from_persona() {
                m.status = MessageStatus::Read;
            }
            m
        })
        .collect()
}

/// Most recent message by timestamp.
pub fn last_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().max_by(|a, b| a.chronological_cmp(b))
}

/// Group messages by [`Message::day_label`], keeping first-seen label order.
pub fn group_by_day(messages: &[Message], now: DateTime<Utc>) -> Vec<(String, Vec<Message>)> {
    let mut groups: Vec<(String, Vec<Message>)> = Vec::new();
    for m in messages {
        let label = m.day_label(now);
        match groups.iter_mut().find(|(l, _)| *l == label) {
            Some((_, bucket)) => bucket.push(m.clone()),
            None => groups.push((label, vec![m.clone()])),
        }
    }
    groups
}
