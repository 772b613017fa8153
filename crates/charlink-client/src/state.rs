//! Observable conversation state.
//!
//! A [`ConversationView`] is replaced wholesale on every change and
//! published through a `watch` channel; readers always see a consistent
//! value.

use std::sync::Arc;

use charlink_shared::{CharacterId, Message};
use serde::Serialize;

use crate::error::{ConversationError, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    /// No character selected.
    #[default]
    Idle,
    /// Live-subscribed to one character's messages.
    Subscribed { character_id: CharacterId },
}

/// The public operation that produced a [`ReportedError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    StartConversation,
    SendMessage,
    QuickReply,
    DeleteMessage,
    /// The background listener lost its subscription.
    Listen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub operation: Operation,
    pub message: String,
}

impl ReportedError {
    pub fn new(operation: Operation, err: &ConversationError) -> Self {
        Self {
            kind: err.kind(),
            operation,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub phase: Phase,
    /// Latest snapshot from the Message Log, in subscriber order.
    pub messages: Arc<[Message]>,
    /// A send or delete is in flight.
    pub is_loading: bool,
    /// Waiting on the generative backend.
    pub pending_reply: bool,
    /// Reply text received so far while streaming.
    pub partial_reply: Option<String>,
    pub error: Option<ReportedError>,
}

impl ConversationView {
    pub fn character_id(&self) -> Option<&CharacterId> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Subscribed { character_id } => Some(character_id),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(self.phase, Phase::Subscribed { .. })
    }
}

impl Default for ConversationView {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            messages: Arc::from(Vec::new()),
            is_loading: false,
            pending_reply: false,
            partial_reply: None,
            error: None,
        }
    }
}
