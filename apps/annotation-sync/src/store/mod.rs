//! Collaborator interfaces: documents, cards and decks.

pub mod fs;
pub mod memory;

use annotation_core::{Card, Deck};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;

pub use fs::FsDocumentStore;
pub use memory::{MemoryCardStore, MemoryDocumentStore};

type Result<T> = std::result::Result<T, StoreError>;

/// Change to a document, as reported by a document store.
///
/// Paths are store-relative with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    Created(String),
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String },
}

impl DocumentEvent {
    /// Path the event is about (the new path for renames).
    pub fn path(&self) -> &str {
        match self {
            Self::Created(p) | Self::Modified(p) | Self::Deleted(p) => p,
            Self::Renamed { to, .. } => to,
        }
    }
}

/// Where annotated documents live.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<String>;
    async fn write(&self, path: &str, content: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
    async fn exists(&self, path: &str) -> bool;

    /// Start delivering change events. A new subscription replaces the old one.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<DocumentEvent>>;

    /// Stop delivering change events.
    fn unsubscribe(&self) {}
}

/// Persistent card records.
#[async_trait]
pub trait CardStore: Send + Sync {
    async fn get_card_by_uuid(&self, uuid: &str) -> Result<Option<Card>>;
    async fn save_card(&self, card: &Card) -> Result<()>;
    async fn delete_card(&self, uuid: &str) -> Result<()>;

    /// Move a card out of `from_deck` into `card.deck_id`.
    async fn move_card(&self, card: &Card, from_deck: &str) -> Result<()> {
        let _ = from_deck;
        self.delete_card(&card.uuid).await?;
        self.save_card(card).await
    }
}

/// Deck lookup and creation.
#[async_trait]
pub trait DeckService: Send + Sync {
    async fn get_deck(&self, id: &str) -> Result<Option<Deck>>;
    async fn get_all_decks(&self) -> Result<Vec<Deck>>;
    async fn create_deck(&self, name: &str) -> Result<Deck>;

    /// Deck names compare case-insensitively.
    async fn find_deck_by_name(&self, name: &str) -> Result<Option<Deck>> {
        Ok(self
            .get_all_decks()
            .await?
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name)))
    }
}
