//! Gallery view model: the newest-first, paginated list of images the UI
//! renders, plus the selected entry for swipe/arrow navigation.
//!
//! All state sits behind one lock that is never held across an await, so
//! readers always see a fully sorted sequence. Page fetches are guarded
//! against re-entry: a second `load_next_page` while one is in flight is a
//! no-op.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::GalleryError;
use crate::gateway::ObjectMeta;
use crate::intake::StoredImage;
use crate::naming::CanonicalName;
use crate::session::Session;
use crate::Options;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryEntry {
    pub url: String,
    pub name: CanonicalName,
    /// Capture date from the name prefix; undated names sort last
    pub sort_key: Option<NaiveDate>,
}

impl GalleryEntry {
    pub fn new(url: impl Into<String>, name: CanonicalName) -> Self {
        let sort_key = name.sort_key();
        Self {
            url: url.into(),
            name,
            sort_key,
        }
    }

    pub fn from_stored(image: &StoredImage) -> Self {
        Self::new(image.url.clone(), image.name.clone())
    }

    /// Entry for a listed object; the name is the key without `prefix`.
    pub fn from_listing(key: &str, meta: &ObjectMeta, prefix: &str) -> Self {
        let name = key.strip_prefix(prefix).unwrap_or(key);
        Self::new(meta.url.clone(), CanonicalName::from_existing(name))
    }
}

/// Fetch cycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Loading,
    Failed(GalleryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { added: usize },
    /// Another fetch is outstanding; nothing was requested
    InFlight,
    /// The listing has no more pages
    Exhausted,
    /// The view model was reset while this fetch was outstanding; its
    /// page was dropped
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PageCursor {
    Start,
    Next(String),
    Exhausted,
}

#[derive(Debug)]
struct GalleryState {
    entries: Vec<GalleryEntry>,
    cursor: PageCursor,
    fetch: FetchState,
    selected: usize,
    /// Bumped by `reset`; a fetch started under an older value is stale
    generation: u64,
}

impl Default for GalleryState {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            cursor: PageCursor::Start,
            fetch: FetchState::Idle,
            selected: 0,
            generation: 0,
        }
    }
}

impl GalleryState {
    /// Add entries not already present by name, then stable-sort newest
    /// first. The selection follows the entry it pointed at.
    fn insert(&mut self, entries: impl IntoIterator<Item = GalleryEntry>) -> usize {
        let selected_name = self.entries.get(self.selected).map(|e| e.name.clone());
        let mut known: HashSet<CanonicalName> = self.entries.iter().map(|e| e.name.clone()).collect();

        let before = self.entries.len();
        for entry in entries {
            if known.insert(entry.name.clone()) {
                self.entries.push(entry);
            }
        }
        let added = self.entries.len() - before;
        if added == 0 {
            return 0;
        }

        self.entries.sort_by(|a, b| b.sort_key.cmp(&a.sort_key));
        if let Some(name) = selected_name {
            if let Some(pos) = self.entries.iter().position(|e| e.name == name) {
                self.selected = pos;
            }
        }
        added
    }

    fn clamp(&self, index: usize) -> usize {
        index.min(self.entries.len().saturating_sub(1))
    }
}

/// Resets a fetch left in `Loading` when its future is dropped mid-flight.
struct LoadingGuard<'a> {
    state: &'a Mutex<GalleryState>,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            if state.fetch == FetchState::Loading {
                state.fetch = FetchState::Idle;
            }
        }
    }
}

pub struct GalleryViewModel {
    session: Arc<Session>,
    prefix: String,
    page_size: usize,
    state: Mutex<GalleryState>,
}

impl GalleryViewModel {
    pub fn new(session: Arc<Session>, options: &Options) -> Self {
        Self {
            session,
            prefix: options.storage_prefix.clone(),
            page_size: options.page_size.max(1),
            state: Mutex::new(GalleryState::default()),
        }
    }

    /// Snapshot of the entries, newest first.
    pub fn current_entries(&self) -> Vec<GalleryEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn fetch_state(&self) -> FetchState {
        self.state.lock().fetch.clone()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.lock().cursor == PageCursor::Exhausted
    }

    /// True while the session has no identity; fetches are refused.
    pub fn is_blocked(&self) -> bool {
        self.session.identity().is_none()
    }

    /// Fetch the next page and merge it in.
    pub async fn load_next_page(&self) -> Result<LoadOutcome, GalleryError> {
        let (cursor, generation) = {
            let mut state = self.state.lock();
            if state.fetch == FetchState::Loading {
                debug!("page fetch already in flight");
                return Ok(LoadOutcome::InFlight);
            }
            let cursor = match &state.cursor {
                PageCursor::Exhausted => return Ok(LoadOutcome::Exhausted),
                PageCursor::Start => None,
                PageCursor::Next(token) => Some(token.clone()),
            };
            if let Err(e) = self.session.require_identity() {
                let err = GalleryError::from(e);
                state.fetch = FetchState::Failed(err.clone());
                return Err(err);
            }
            state.fetch = FetchState::Loading;
            (cursor, state.generation)
        };

        let mut guard = LoadingGuard {
            state: &self.state,
            armed: true,
        };
        let listed = self
            .session
            .storage()
            .list(&self.prefix, cursor.as_deref(), self.page_size)
            .await;
        guard.armed = false;

        let mut state = self.state.lock();
        if state.generation != generation {
            // Reset kept `Loading` for this fetch; hand the slot back
            state.fetch = FetchState::Idle;
            debug!("dropping page fetched before reset");
            return Ok(LoadOutcome::Discarded);
        }
        match listed {
            Ok(page) => {
                let entries: Vec<GalleryEntry> = page
                    .items
                    .iter()
                    .map(|(key, meta)| GalleryEntry::from_listing(key, meta, &self.prefix))
                    .collect();
                let added = state.insert(entries);
                state.cursor = match page.next_cursor {
                    Some(token) => PageCursor::Next(token),
                    None => PageCursor::Exhausted,
                };
                state.fetch = FetchState::Idle;
                info!(added, total = state.entries.len(), exhausted = state.cursor == PageCursor::Exhausted, "loaded gallery page");
                Ok(LoadOutcome::Loaded { added })
            }
            Err(e) => {
                let err = GalleryError::Storage(format!("{:#}", e));
                warn!("gallery page fetch failed: {}", err);
                state.fetch = FetchState::Failed(err.clone());
                Err(err)
            }
        }
    }

    /// Merge freshly uploaded entries. Returns how many were new.
    pub fn merge_uploaded(&self, entries: impl IntoIterator<Item = GalleryEntry>) -> usize {
        let added = self.state.lock().insert(entries);
        if added > 0 {
            debug!(added, "merged uploaded entries");
        }
        added
    }

    pub fn selected_index(&self) -> usize {
        self.state.lock().selected
    }

    pub fn selected(&self) -> Option<GalleryEntry> {
        let state = self.state.lock();
        state.entries.get(state.selected).cloned()
    }

    /// Step the selection by one; clamped, never wraps.
    pub fn navigate(&self, direction: Direction) -> usize {
        let mut state = self.state.lock();
        let next = match direction {
            Direction::Forward => state.selected.saturating_add(1),
            Direction::Backward => state.selected.saturating_sub(1),
        };
        state.selected = state.clamp(next);
        state.selected
    }

    pub fn select(&self, index: usize) -> usize {
        let mut state = self.state.lock();
        state.selected = state.clamp(index);
        state.selected
    }

    /// Drop all entries and start paging from the beginning again. A fetch
    /// still in flight keeps its slot and its page is discarded when it
    /// lands.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let fetch = match state.fetch {
            FetchState::Loading => FetchState::Loading,
            _ => FetchState::Idle,
        };
        *state = GalleryState {
            fetch,
            generation: state.generation + 1,
            ..GalleryState::default()
        };
    }
}
