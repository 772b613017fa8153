//! # charlink-store
//!
//! Persistence for characters and conversations.
//!
//! Two traits describe what the rest of the system needs: [`PersonaStore`]
//! for character records and [`MessageLog`] for per-conversation message
//! history with live, whole-snapshot subscriptions.  Two adapters implement
//! both: the in-process [`MemoryStore`] and the SQLite-backed [`Database`],
//! which wraps a `rusqlite::Connection` and provides typed CRUD helpers.

pub mod characters;
pub mod database;
pub mod hub;
pub mod log;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod personas;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use hub::SnapshotHub;
pub use log::{DeleteScope, MessageLog, MessageSubscription, SharedSnapshot, SnapshotOrder, ViewSide};
pub use memory::MemoryStore;
pub use personas::{CharacterSubscription, PersonaStore};
