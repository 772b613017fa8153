//! Creating new characters.
//!
//! Validation happens before any I/O.  The avatar is uploaded first; the
//! character is only stored once its image URL is known.

use std::sync::Arc;

use bytes::Bytes;
use charlink_net::ImageHost;
use charlink_shared::constants::MAX_AVATAR_SIZE;
use charlink_shared::error::require_text;
use charlink_shared::{Character, CharacterId, UserId, ValidationError, Visibility};
use charlink_store::PersonaStore;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::CreationError;

/// Form input for a new character.
#[derive(Debug, Clone, Default)]
pub struct CharacterDraft {
    pub name: String,
    /// Free text.  Anything that does not parse as a number is stored as 0.
    pub age: String,
    pub gender: String,
    pub traits: Vec<String>,
    /// Becomes the persona.
    pub background: String,
    /// How the character addresses the user; becomes the greeting.
    pub address_as: String,
    pub avatar: Option<Bytes>,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CreateState {
    #[default]
    Idle,
    Loading,
    Success(CharacterId),
    Error(String),
}

pub struct CharacterCreator {
    store: Arc<dyn PersonaStore>,
    images: Arc<dyn ImageHost>,
    max_avatar_bytes: usize,
    state: watch::Sender<CreateState>,
}

impl CharacterCreator {
    pub fn new(store: Arc<dyn PersonaStore>, images: Arc<dyn ImageHost>) -> Self {
        let (state, _rx) = watch::channel(CreateState::Idle);
        Self {
            store,
            images,
            max_avatar_bytes: MAX_AVATAR_SIZE,
            state,
        }
    }

    pub fn with_max_avatar_bytes(mut self, max: usize) -> Self {
        self.max_avatar_bytes = max;
        self
    }

    pub fn state(&self) -> CreateState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CreateState> {
        self.state.subscribe()
    }

    pub fn reset(&self) {
        self.state.send_replace(CreateState::Idle);
    }

    pub async fn create(
        &self,
        owner: &UserId,
        draft: CharacterDraft,
    ) -> Result<Character, CreationError> {
        match self.try_create(owner, draft).await {
            Ok(character) => {
                self.state
                    .send_replace(CreateState::Success(character.id.clone()));
                Ok(character)
            }
            Err(err) => {
                warn!(owner = %owner, error = %err, "character creation failed");
                self.state.send_replace(CreateState::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn try_create(
        &self,
        owner: &UserId,
        draft: CharacterDraft,
    ) -> Result<Character, CreationError> {
        let avatar = self.validate(owner, &draft)?;
        self.state.send_replace(CreateState::Loading);

        let avatar_url = self.images.upload(avatar).await?;

        let mut character = Character::new(owner.clone(), draft.name.trim(), draft.background);
        character.age = draft.age.trim().parse().unwrap_or(0);
        character.gender = draft.gender.trim().to_string();
        character.greeting = draft.address_as;
        character.avatar_url = avatar_url;
        character.tags = draft
            .traits
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if draft.private {
            character.visibility = Visibility::Private;
        }

        let stored = self.store.put(character).await?;
        info!(owner = %owner, character = %stored.id, "character created");
        Ok(stored)
    }

    fn validate(&self, owner: &UserId, draft: &CharacterDraft) -> Result<Bytes, ValidationError> {
        require_text("User", owner.as_str())?;
        require_text("Name", &draft.name)?;
        require_text("Age", &draft.age)?;

        let avatar = match &draft.avatar {
            Some(bytes) if !bytes.is_empty() => bytes.clone(),
            _ => return Err(ValidationError::MissingAvatar),
        };
        if avatar.len() > self.max_avatar_bytes {
            return Err(ValidationError::TooLarge {
                what: "Avatar",
                size: avatar.len(),
                max: self.max_avatar_bytes,
            });
        }
        Ok(avatar)
    }
}
