//! The Persona Store: character records and their counters.

use async_trait::async_trait;
use charlink_shared::{Character, CharacterFilter, CharacterId, Counter};
use tokio::sync::watch;

use crate::error::{Result, StoreError};

#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn get(&self, id: &CharacterId) -> Result<Option<Character>>;

    /// Listed characters matching `filter`, ordered as the filter dictates,
    /// at most `limit` of them.
    async fn query(&self, filter: &CharacterFilter, limit: usize) -> Result<Vec<Character>>;

    /// Insert or replace a character.  A blank id is replaced with a fresh
    /// one; the stored record is returned.
    async fn put(&self, character: Character) -> Result<Character>;

    async fn subscribe(&self, id: &CharacterId) -> Result<CharacterSubscription>;

    /// Bump one counter by one.  [`StoreError::NotFound`] for unknown ids.
    async fn increment(&self, id: &CharacterId, counter: Counter) -> Result<()>;
}

/// Assign an id if needed, validate and stamp `updated_at`.
pub(crate) fn prepare_for_put(mut character: Character) -> Result<Character> {
    if character.id.is_blank() {
        character.id = CharacterId::generate();
    }
    character.validate()?;
    character.touch();
    Ok(character)
}

/// Live view of one character; `None` while it does not exist.
#[derive(Debug)]
pub struct CharacterSubscription {
    rx: watch::Receiver<Option<Character>>,
}

impl CharacterSubscription {
    pub fn new(rx: watch::Receiver<Option<Character>>) -> Self {
        Self { rx }
    }

    pub fn current(&mut self) -> Option<Character> {
        self.rx.borrow_and_update().clone()
    }

    pub async fn changed(&mut self) -> Result<Option<Character>> {
        self.rx.changed().await.map_err(|_| StoreError::Closed)?;
        Ok(self.current())
    }
}
