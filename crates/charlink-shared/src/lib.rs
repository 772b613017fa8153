//! # charlink-shared
//!
//! Domain types shared by every Charlink crate: identifiers, the
//! [`Character`](character::Character) and [`Message`](message::Message)
//! models, and the validation errors raised before any I/O happens.

pub mod character;
pub mod constants;
pub mod error;
pub mod message;
pub mod types;

pub use character::{Character, CharacterFilter, Counter, Visibility};
pub use error::ValidationError;
pub use message::{Message, MessageStatus, SenderRole};
pub use types::{CharacterId, ConversationKey, MessageId, UserId};
