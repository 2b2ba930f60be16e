//! In-memory stores with mutation counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use annotation_core::{Card, Deck};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CardStore, DeckService, DocumentEvent, DocumentStore};
use crate::error::StoreError;

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

/// Documents held in a map. Engine writes go through [`DocumentStore::write`]
/// and are counted; the helper methods simulate user edits.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<String, String>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<DocumentEvent>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a document without emitting an event.
    pub fn insert(&self, path: &str, text: &str) {
        if let Ok(mut docs) = self.docs.write() {
            docs.insert(path.to_string(), text.to_string());
        }
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.docs.read().ok()?.get(path).cloned()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event to the current subscriber. Returns false if none.
    pub fn emit(&self, event: DocumentEvent) -> bool {
        self.events
            .lock()
            .ok()
            .and_then(|tx| tx.as_ref().map(|tx| tx.send(event).is_ok()))
            .unwrap_or(false)
    }

    /// User edit: replace text and report a modification.
    pub fn edit(&self, path: &str, text: &str) {
        let existed = self.get(path).is_some();
        self.insert(path, text);
        if existed {
            self.emit(DocumentEvent::Modified(path.to_string()));
        } else {
            self.emit(DocumentEvent::Created(path.to_string()));
        }
    }

    /// User rename: move text and report it.
    pub fn rename(&self, from: &str, to: &str) {
        if let Ok(mut docs) = self.docs.write() {
            if let Some(text) = docs.remove(from) {
                docs.insert(to.to_string(), text);
            }
        }
        self.emit(DocumentEvent::Renamed {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// User deletion.
    pub fn remove(&self, path: &str) {
        if let Ok(mut docs) = self.docs.write() {
            docs.remove(path);
        }
        self.emit(DocumentEvent::Deleted(path.to_string()));
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read(&self, path: &str) -> Result<String, StoreError> {
        self.docs
            .read()
            .map_err(|_| poisoned())?
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("write refused: {}", path)));
        }
        self.docs
            .write()
            .map_err(|_| poisoned())?
            .insert(path.to_string(), content.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.docs.read().map_err(|_| poisoned())?.keys().cloned().collect())
    }

    async fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<DocumentEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().map_err(|_| poisoned())? = Some(tx);
        Ok(rx)
    }

    fn unsubscribe(&self) {
        if let Ok(mut events) = self.events.lock() {
            *events = None;
        }
    }
}

/// Cards and decks held in maps.
#[derive(Default)]
pub struct MemoryCardStore {
    cards: RwLock<HashMap<String, Card>>,
    decks: RwLock<Vec<Deck>>,
    saves: AtomicUsize,
    deletes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryCardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a deck directly. Returns it.
    pub fn add_deck(&self, name: &str) -> Deck {
        let mut decks = match self.decks.write() {
            Ok(decks) => decks,
            Err(poisoned) => poisoned.into_inner(),
        };
        let deck = Deck {
            id: format!("deck-{}", decks.len() + 1),
            name: name.to_string(),
        };
        decks.push(deck.clone());
        deck
    }

    pub fn deck_named(&self, name: &str) -> Option<Deck> {
        self.decks
            .read()
            .ok()?
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn deck_count(&self) -> usize {
        self.decks.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Store a card without counting a mutation.
    pub fn insert_card(&self, card: Card) {
        if let Ok(mut cards) = self.cards.write() {
            cards.insert(card.uuid.clone(), card);
        }
    }

    /// Delete a card the way an external tool would, without counting.
    pub fn remove_card(&self, uuid: &str) -> Option<Card> {
        self.cards.write().ok()?.remove(uuid)
    }

    pub fn card(&self, uuid: &str) -> Option<Card> {
        self.cards.read().ok()?.get(uuid).cloned()
    }

    pub fn cards(&self) -> Vec<Card> {
        self.cards
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Saves plus deletes.
    pub fn mutation_count(&self) -> usize {
        self.save_count() + self.delete_count()
    }

    /// Make every store call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("card store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CardStore for MemoryCardStore {
    async fn get_card_by_uuid(&self, uuid: &str) -> Result<Option<Card>, StoreError> {
        self.check()?;
        Ok(self.cards.read().map_err(|_| poisoned())?.get(uuid).cloned())
    }

    async fn save_card(&self, card: &Card) -> Result<(), StoreError> {
        self.check()?;
        self.cards
            .write()
            .map_err(|_| poisoned())?
            .insert(card.uuid.clone(), card.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_card(&self, uuid: &str) -> Result<(), StoreError> {
        self.check()?;
        self.cards.write().map_err(|_| poisoned())?.remove(uuid);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DeckService for MemoryCardStore {
    async fn get_deck(&self, id: &str) -> Result<Option<Deck>, StoreError> {
        self.check()?;
        Ok(self
            .decks
            .read()
            .map_err(|_| poisoned())?
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn get_all_decks(&self) -> Result<Vec<Deck>, StoreError> {
        self.check()?;
        Ok(self.decks.read().map_err(|_| poisoned())?.clone())
    }

    async fn create_deck(&self, name: &str) -> Result<Deck, StoreError> {
        self.check()?;
        if let Some(existing) = self.deck_named(name) {
            return Ok(existing);
        }
        Ok(self.add_deck(name))
    }
}
