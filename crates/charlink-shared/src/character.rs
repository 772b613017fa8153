//! The persona record behind every conversation.
//!
//! A [`Character`] is created once by its owner and is immutable afterwards
//! except for its stat counters, moderation flags and `updated_at`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{FEED_ALL, FEED_NEW, FEED_POPULAR, FEED_TRENDING};
use crate::error::ValidationError;
use crate::types::{CharacterId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Monotonic stat counters maintained by collaborating services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Counter {
    Likes,
    Views,
    Chats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    /// Store-assigned key.  Empty until the first `put`.
    #[serde(default)]
    pub id: CharacterId,
    /// Creating user; never changes.
    pub owner_id: UserId,

    pub name: String,
    /// Behavioural description fed into every prompt for this character.
    pub persona: String,
    #[serde(default)]
    pub greeting: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub age: u32,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub premium: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub chats: u64,
}

impl Character {
    /// A new public character with zeroed counters and no id yet.
    pub fn new(owner_id: UserId, name: impl Into<String>, persona: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: CharacterId::default(),
            owner_id,
            name: name.into(),
            persona: persona.into(),
            greeting: String::new(),
            avatar_url: String::new(),
            age: 0,
            gender: String::new(),
            tags: BTreeSet::new(),
            visibility: Visibility::Public,
            banned: false,
            verified: false,
            premium: false,
            created_at: now,
            updated_at: now,
            likes: 0,
            views: 0,
            chats: 0,
        }
    }

    /// A character may only be persisted once `id`, `owner_id` and `name`
    /// are all non-empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_blank() {
            return Err(ValidationError::InvalidCharacter("id"));
        }
        if self.owner_id.is_blank() {
            return Err(ValidationError::InvalidCharacter("owner"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::InvalidCharacter("name"));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Valid and not banned.
    pub fn is_accessible(&self) -> bool {
        !self.banned && self.is_valid()
    }

    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }

    /// Private characters are visible to their owner only.
    pub fn can_view(&self, viewer: &UserId) -> bool {
        if !self.is_accessible() {
            return false;
        }
        !self.is_private() || &self.owner_id == viewer
    }

    /// Eligible for public feeds and searches.
    pub fn is_listed(&self) -> bool {
        !self.banned && !self.is_private()
    }

    /// Refresh `updated_at`.  Never moves the timestamp backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Likes => self.likes,
            Counter::Views => self.views,
            Counter::Chats => self.chats,
        }
    }

    /// Increment a stat counter, saturating at `u64::MAX`.
    pub fn increment(&mut self, counter: Counter) {
        let slot = match counter {
            Counter::Likes => &mut self.likes,
            Counter::Views => &mut self.views,
            Counter::Chats => &mut self.chats,
        };
        *slot = slot.saturating_add(1);
    }
}

// ---------------------------------------------------------------------------
// Feed filters
// ---------------------------------------------------------------------------

/// Selection and ordering for character listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CharacterFilter {
    /// Newest first.
    All,
    /// Newest first.
    New,
    /// Most chatted first.
    Trending,
    /// Most chatted first.
    Popular,
    /// Newest first, restricted to one tag.
    Category { name: String },
    /// Name prefix match (case-sensitive), optionally restricted to one tag.
    Search {
        text: String,
        category: Option<String>,
    },
}

impl CharacterFilter {
    /// Map a feed tab label to a filter.  Unknown labels are categories.
    pub fn from_label(label: &str) -> Self {
        match label {
            FEED_ALL => Self::All,
            FEED_NEW => Self::New,
            FEED_TRENDING => Self::Trending,
            FEED_POPULAR => Self::Popular,
            other => Self::Category {
                name: other.to_string(),
            },
        }
    }

    pub fn orders_by_chats(&self) -> bool {
        matches!(self, Self::Trending | Self::Popular)
    }

    /// Whether `character` belongs in this listing.  Banned and private
    /// characters never do.
    pub fn matches(&self, character: &Character) -> bool {
        if !character.is_listed() {
            return false;
        }
        match self {
            Self::All | Self::New | Self::Trending | Self::Popular => true,
            Self::Category { name } => category_matches(character, Some(name)),
            Self::Search { text, category } => {
                character.name.starts_with(text.as_str())
                    && category_matches(character, category.as_deref())
            }
        }
    }

    /// Filter, order and truncate `characters` for this listing.
    pub fn apply(&self, characters: impl IntoIterator<Item = Character>, limit: usize) -> Vec<Character> {
        let mut selected: Vec<Character> = characters
            .into_iter()
            .filter(|c| self.matches(c))
            .collect();

        match self {
            Self::Trending | Self::Popular => selected.sort_by(|a, b| {
                b.chats
                    .cmp(&a.chats)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            }),
            // Name searches keep the store's name order.
            Self::Search { text, .. } if !text.is_empty() => {
                selected.sort_by(|a, b| a.name.cmp(&b.name))
            }
            _ => selected.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }

        selected.truncate(limit);
        selected
    }
}

fn category_matches(character: &Character, category: Option<&str>) -> bool {
    match category {
        None | Some("") | Some(FEED_ALL) => true,
        Some(name) => character.tags.contains(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn character(id: &str, name: &str) -> Character {
        let mut c = Character::new(UserId::new("owner"), name, "persona");
        c.id = CharacterId::new(id);
        c
    }

    #[test]
    fn test_validate_requires_id_owner_and_name() {
        let mut c = Character::new(UserId::new("owner"), "Ava", "calm");
        assert_eq!(c.validate(), Err(ValidationError::InvalidCharacter("id")));

        c.id = CharacterId::new("c1");
        assert!(c.validate().is_ok());

        c.name = "   ".into();
        assert_eq!(c.validate(), Err(ValidationError::InvalidCharacter("name")));

        let mut orphan = character("c2", "Bo");
        orphan.owner_id = UserId::new("");
        assert_eq!(
            orphan.validate(),
            Err(ValidationError::InvalidCharacter("owner"))
        );
    }

    #[test]
    fn test_private_character_visible_to_owner_only() {
        let mut c = character("c1", "Ava");
        c.visibility = Visibility::Private;

        assert!(c.can_view(&UserId::new("owner")));
        assert!(!c.can_view(&UserId::new("someone-else")));
    }

    #[test]
    fn test_banned_character_hidden_from_everyone() {
        let mut c = character("c1", "Ava");
        c.banned = true;
        assert!(!c.can_view(&UserId::new("owner")));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut c = character("c1", "Ava");
        let future = Utc::now() + Duration::hours(1);
        c.updated_at = future;
        c.touch();
        assert_eq!(c.updated_at, future);
    }

    #[test]
    fn test_counters_only_grow() {
        let mut c = character("c1", "Ava");
        c.chats = u64::MAX;
        c.increment(Counter::Chats);
        c.increment(Counter::Likes);
        assert_eq!(c.counter(Counter::Chats), u64::MAX);
        assert_eq!(c.counter(Counter::Likes), 1);
    }

    #[test]
    fn test_filter_from_label() {
        assert_eq!(CharacterFilter::from_label("All"), CharacterFilter::All);
        assert_eq!(
            CharacterFilter::from_label("Popular"),
            CharacterFilter::Popular
        );
        assert_eq!(
            CharacterFilter::from_label("Fantasy"),
            CharacterFilter::Category {
                name: "Fantasy".into()
            }
        );
    }

    #[test]
    fn test_trending_orders_by_chats_and_skips_unlisted() {
        let mut quiet = character("a", "Quiet");
        quiet.chats = 1;
        let mut busy = character("b", "Busy");
        busy.chats = 50;
        let mut hidden = character("c", "Hidden");
        hidden.chats = 99;
        hidden.visibility = Visibility::Private;
        let mut banned = character("d", "Banned");
        banned.banned = true;

        let out = CharacterFilter::Trending.apply(vec![quiet, busy, hidden, banned], 10);
        let names: Vec<&str> = out.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Busy", "Quiet"]);
    }

    #[test]
    fn test_new_orders_newest_first_and_truncates() {
        let mut old = character("a", "Old");
        old.created_at = Utc::now() - Duration::days(2);
        let mut mid = character("b", "Mid");
        mid.created_at = Utc::now() - Duration::days(1);
        let fresh = character("c", "Fresh");

        let out = CharacterFilter::New.apply(vec![old, fresh, mid], 2);
        let names: Vec<&str> = out.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Fresh", "Mid"]);
    }

    #[test]
    fn test_search_by_prefix_and_category() {
        let mut knight = character("a", "Sir Lance");
        knight.tags.insert("Fantasy".into());
        let mut pilot = character("b", "Sir Wings");
        pilot.tags.insert("SciFi".into());
        let other = character("c", "Madam X");

        let filter = CharacterFilter::Search {
            text: "Sir".into(),
            category: Some("Fantasy".into()),
        };
        let out = filter.apply(vec![knight, pilot, other], 50);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Sir Lance");
    }
}
