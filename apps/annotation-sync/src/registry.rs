//! In-memory identity registry: uuid to card cache and uuid to document sources.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use annotation_core::{AnnotationSource, Card};
use serde::Serialize;

use crate::error::StoreError;
use crate::store::CardStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub cached_cards: usize,
    pub tracked_uuids: usize,
    pub tracked_sources: usize,
}

/// Tracks which document locations carry which card identity.
///
/// Entries live only in memory and never mutate documents or the card store.
pub struct IdentityRegistry {
    cards: Arc<dyn CardStore>,
    cache: RwLock<HashMap<String, Card>>,
    sources: RwLock<HashMap<String, Vec<AnnotationSource>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl IdentityRegistry {
    pub fn new(cards: Arc<dyn CardStore>) -> Self {
        Self {
            cards,
            cache: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Cached card, or a store lookup that fills the cache.
    pub async fn find_card_by_uuid(&self, uuid: &str) -> Result<Option<Card>, StoreError> {
        if let Some(card) = read(&self.cache).get(uuid).cloned() {
            return Ok(Some(card));
        }
        self.load_card(uuid).await
    }

    /// Always ask the store, then refresh or evict the cache entry.
    pub async fn load_card(&self, uuid: &str) -> Result<Option<Card>, StoreError> {
        let card = self.cards.get_card_by_uuid(uuid).await?;
        match &card {
            Some(card) => {
                write(&self.cache).insert(uuid.to_string(), card.clone());
            }
            None => {
                write(&self.cache).remove(uuid);
            }
        }
        Ok(card)
    }

    /// Add or refresh a source, deduplicated by document path and anchor.
    pub fn register_annotation(&self, uuid: &str, source: AnnotationSource) {
        let mut sources = write(&self.sources);
        let entry = sources.entry(uuid.to_string()).or_default();
        match entry.iter_mut().find(|s| s.same_location(&source)) {
            Some(existing) => *existing = source,
            None => entry.push(source),
        }
    }

    pub fn find_annotations_by_uuid(&self, uuid: &str) -> Vec<AnnotationSource> {
        read(&self.sources).get(uuid).cloned().unwrap_or_default()
    }

    /// Returns true if a source was removed.
    pub fn unregister_annotation(&self, uuid: &str, document_path: &str, block_anchor: &str) -> bool {
        let mut sources = write(&self.sources);
        let Some(entry) = sources.get_mut(uuid) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|s| !(s.document_path == document_path && s.block_anchor == block_anchor));
        let removed = entry.len() != before;
        if entry.is_empty() {
            sources.remove(uuid);
        }
        removed
    }

    /// Rewrite every source path after a rename. Anchors and uuids are kept.
    ///
    /// Returns the number of rewritten sources.
    pub fn update_document_path(&self, old_path: &str, new_path: &str) -> usize {
        let mut count = 0;
        for entry in write(&self.sources).values_mut() {
            for source in entry.iter_mut().filter(|s| s.document_path == old_path) {
                source.document_path = new_path.to_string();
                count += 1;
            }
        }
        for card in write(&self.cache).values_mut() {
            for source in card
                .annotation_sources
                .iter_mut()
                .filter(|s| s.document_path == old_path)
            {
                source.document_path = new_path.to_string();
            }
        }
        count
    }

    /// Uuids with at least one source in a document.
    pub fn uuids_in_document(&self, document_path: &str) -> Vec<String> {
        let mut uuids: Vec<String> = read(&self.sources)
            .iter()
            .filter(|(_, sources)| sources.iter().any(|s| s.document_path == document_path))
            .map(|(uuid, _)| uuid.clone())
            .collect();
        uuids.sort();
        uuids
    }

    pub fn update_card_cache(&self, card: Card) {
        write(&self.cache).insert(card.uuid.clone(), card);
    }

    pub fn remove_card_from_cache(&self, uuid: &str) {
        write(&self.cache).remove(uuid);
    }

    /// Forget everything: cached cards and tracked sources.
    pub fn clear_cache(&self) {
        write(&self.cache).clear();
        write(&self.sources).clear();
    }

    pub fn stats(&self) -> RegistryStats {
        let sources = read(&self.sources);
        RegistryStats {
            cached_cards: read(&self.cache).len(),
            tracked_uuids: sources.len(),
            tracked_sources: sources.values().map(Vec::len).sum(),
        }
    }
}
