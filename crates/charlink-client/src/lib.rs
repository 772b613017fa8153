//! # charlink-client
//!
//! The application layer: conversation orchestration, character browsing
//! and character creation.  Each component owns its observable state,
//! published through a `tokio::sync::watch` channel, and talks to the
//! outside world only through the `charlink-store` and `charlink-net`
//! traits it was constructed with.

pub mod conversation;
pub mod creation;
pub mod error;
pub mod feed;
pub mod state;

pub use conversation::{recent_history, ConversationOrchestrator, OrchestratorConfig, SendOutcome};
pub use creation::{CharacterCreator, CharacterDraft, CreateState};
pub use error::{ConversationError, CreationError, ErrorKind, FeedError};
pub use feed::{CharacterFeed, FeedView};
pub use state::{ConversationView, Operation, Phase, ReportedError};
