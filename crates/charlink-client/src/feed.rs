//! Character browsing.

use std::sync::Arc;

use charlink_shared::constants::{DEFAULT_FEED_LIMIT, FEED_ALL, SEARCH_LIMIT};
use charlink_shared::{Character, CharacterFilter};
use charlink_store::PersonaStore;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::FeedError;

#[derive(Debug, Clone, Serialize)]
pub struct FeedView {
    /// Selected category label ("All", "Trending", "Fantasy", ...).
    pub category: String,
    pub characters: Vec<Character>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl Default for FeedView {
    fn default() -> Self {
        Self {
            category: FEED_ALL.to_string(),
            characters: Vec::new(),
            is_loading: false,
            error: None,
        }
    }
}

pub struct CharacterFeed {
    store: Arc<dyn PersonaStore>,
    view: watch::Sender<FeedView>,
    // Serialises loads so an older response cannot overwrite a newer one.
    loading: Mutex<()>,
}

impl CharacterFeed {
    pub fn new(store: Arc<dyn PersonaStore>) -> Self {
        let (view, _rx) = watch::channel(FeedView::default());
        Self {
            store,
            view,
            loading: Mutex::new(()),
        }
    }

    pub fn view(&self) -> FeedView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<FeedView> {
        self.view.subscribe()
    }

    /// Switch category.  Reloads only when the label actually changes;
    /// returns whether it did.
    pub async fn select_category(&self, label: &str) -> Result<bool, FeedError> {
        let changed = self.view.send_if_modified(|view| {
            if view.category == label {
                return false;
            }
            view.category = label.to_string();
            true
        });
        if !changed {
            return Ok(false);
        }
        self.load(label, None).await?;
        Ok(true)
    }

    /// Reload the selected category.
    pub async fn refresh(&self) -> Result<(), FeedError> {
        let label = self.view.borrow().category.clone();
        self.load(&label, None).await
    }

    /// Name-prefix search within the selected category.
    pub async fn search(&self, text: &str) -> Result<(), FeedError> {
        let label = self.view.borrow().category.clone();
        self.load(&label, Some(text.trim())).await
    }

    async fn load(&self, label: &str, search: Option<&str>) -> Result<(), FeedError> {
        let _serial = self.loading.lock().await;
        let (filter, limit) = filter_for(label, search);

        self.view.send_modify(|view| {
            view.is_loading = true;
            view.error = None;
        });

        let result = self.store.query(&filter, limit).await;
        let current = self.view.borrow().category == label;

        match result {
            Ok(characters) => {
                debug!(category = label, count = characters.len(), "feed loaded");
                if current {
                    self.view.send_modify(|view| {
                        view.characters = characters;
                        view.is_loading = false;
                    });
                }
                Ok(())
            }
            Err(e) => {
                let err = FeedError::from(e);
                warn!(category = label, error = %err, "feed load failed");
                if current {
                    self.view.send_modify(|view| {
                        view.characters.clear();
                        view.error = Some(err.to_string());
                        view.is_loading = false;
                    });
                }
                Err(err)
            }
        }
    }
}

/// Listing filters get the default page size, category and text searches
/// the larger search page.
pub fn filter_for(label: &str, search: Option<&str>) -> (CharacterFilter, usize) {
    match search.filter(|s| !s.is_empty()) {
        Some(text) => (
            CharacterFilter::Search {
                text: text.to_string(),
                category: Some(label.to_string()),
            },
            SEARCH_LIMIT,
        ),
        None => match CharacterFilter::from_label(label) {
            CharacterFilter::Category { name } => (
                CharacterFilter::Search {
                    text: String::new(),
                    category: Some(name),
                },
                SEARCH_LIMIT,
            ),
            listing => (listing, DEFAULT_FEED_LIMIT),
        },
    }
}
