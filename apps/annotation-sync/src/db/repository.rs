//! SQLite implementation of the card store and deck service.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use annotation_core::{AnnotationSource, Card, ContentType, Deck, LineRange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::store::{CardStore, DeckService};

type Result<T> = std::result::Result<T, StoreError>;

/// Cards and decks in a local SQLite database.
///
/// Calls hold the connection lock only for the duration of one statement
/// batch; nothing awaits while it is held.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp {:?}: {}", value, e)))
}

struct CardRow {
    id: String,
    uuid: String,
    deck_id: String,
    content: String,
    content_type: String,
    template_id: Option<String>,
    created_at: String,
    modified_at: String,
}

impl CardRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uuid: row.get(1)?,
            deck_id: row.get(2)?,
            content: row.get(3)?,
            content_type: row.get(4)?,
            template_id: row.get(5)?,
            created_at: row.get(6)?,
            modified_at: row.get(7)?,
        })
    }

    fn into_card(self, annotation_sources: Vec<AnnotationSource>) -> Result<Card> {
        Ok(Card {
            id: self.id,
            uuid: self.uuid,
            deck_id: self.deck_id,
            content: self.content,
            content_type: ContentType::from_str(&self.content_type).unwrap_or_default(),
            template_id: self.template_id,
            created: parse_timestamp(&self.created_at)?,
            modified: parse_timestamp(&self.modified_at)?,
            annotation_sources,
        })
    }
}

impl SqliteStore {
    /// Open database at path, creating if necessary.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Open in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(super::schema::SCHEMA)?;
        conn.execute_batch(super::schema::INIT_SCHEMA_VERSION)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("database lock poisoned".to_string()))
    }

    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?)
    }

    pub fn card_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cards", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn load_sources(conn: &Connection, uuid: &str) -> Result<Vec<AnnotationSource>> {
        let mut stmt = conn.prepare(
            "SELECT document_path, block_anchor, last_sync, start_line, end_line
             FROM annotation_sources WHERE card_uuid = ?1 ORDER BY document_path, block_anchor",
        )?;
        let rows = stmt
            .query_map(params![uuid], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(document_path, block_anchor, last_sync, start, end)| -> Result<AnnotationSource> {
                Ok(AnnotationSource {
                    document_path,
                    block_anchor,
                    last_sync: parse_timestamp(&last_sync)?,
                    line_range: LineRange {
                        start: start.max(0) as usize,
                        end: end.max(0) as usize,
                    },
                })
            })
            .collect()
    }
}

#[async_trait]
impl CardStore for SqliteStore {
    async fn get_card_by_uuid(&self, uuid: &str) -> Result<Option<Card>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, uuid, deck_id, content, content_type, template_id, created_at, modified_at
                 FROM cards WHERE uuid = ?1",
                params![uuid],
                CardRow::from_row,
            )
            .optional()?;

        match row {
            Some(row) => {
                let sources = Self::load_sources(&conn, uuid)?;
                row.into_card(sources).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn save_card(&self, card: &Card) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO cards (id, uuid, deck_id, content, content_type, template_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(uuid) DO UPDATE SET
                deck_id = excluded.deck_id,
                content = excluded.content,
                content_type = excluded.content_type,
                template_id = excluded.template_id,
                modified_at = excluded.modified_at",
            params![
                card.id,
                card.uuid,
                card.deck_id,
                card.content,
                card.content_type.as_str(),
                card.template_id,
                card.created.to_rfc3339(),
                card.modified.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "DELETE FROM annotation_sources WHERE card_uuid = ?1",
            params![card.uuid],
        )?;
        for source in &card.annotation_sources {
            tx.execute(
                "INSERT OR REPLACE INTO annotation_sources
                    (card_uuid, document_path, block_anchor, last_sync, start_line, end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    card.uuid,
                    source.document_path,
                    source.block_anchor,
                    source.last_sync.to_rfc3339(),
                    source.line_range.start as i64,
                    source.line_range.end as i64,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn delete_card(&self, uuid: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM annotation_sources WHERE card_uuid = ?1",
            params![uuid],
        )?;
        tx.execute("DELETE FROM cards WHERE uuid = ?1", params![uuid])?;
        tx.commit()?;
        Ok(())
    }

    /// Deck membership is the `deck_id` column, so the upsert moves the card.
    async fn move_card(&self, card: &Card, _from_deck: &str) -> Result<()> {
        self.save_card(card).await
    }
}

#[async_trait]
impl DeckService for SqliteStore {
    async fn get_deck(&self, id: &str) -> Result<Option<Deck>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name FROM decks WHERE id = ?1",
            params![id],
            |row| {
                Ok(Deck {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    async fn get_all_decks(&self) -> Result<Vec<Deck>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name FROM decks ORDER BY name")?;
        let decks = stmt
            .query_map([], |row| {
                Ok(Deck {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decks)
    }

    async fn find_deck_by_name(&self, name: &str) -> Result<Option<Deck>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name FROM decks WHERE name = ?1 COLLATE NOCASE",
            params![name],
            |row| {
                Ok(Deck {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    async fn create_deck(&self, name: &str) -> Result<Deck> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO decks (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![uuid::Uuid::new_v4().to_string(), name, Utc::now().to_rfc3339()],
        )?;
        let deck = conn.query_row(
            "SELECT id, name FROM decks WHERE name = ?1 COLLATE NOCASE",
            params![name],
            |row| {
                Ok(Deck {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )?;
        Ok(deck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn card(uuid: &str, deck_id: &str) -> Card {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        Card {
            id: format!("card-{}", uuid),
            uuid: uuid.to_string(),
            deck_id: deck_id.to_string(),
            content: "Q: 2+2?\nA: 4".to_string(),
            content_type: ContentType::QuestionAnswer,
            template_id: Some("basic".to_string()),
            created: at,
            modified: at,
            annotation_sources: vec![AnnotationSource {
                document_path: "math.md".to_string(),
                block_anchor: "tk-1".to_string(),
                last_sync: at,
                line_range: LineRange { start: 0, end: 8 },
            }],
        }
    }

    #[tokio::test]
    async fn test_save_and_load_card() {
        let store = SqliteStore::open_in_memory().unwrap();
        let deck = store.create_deck("math").await.unwrap();
        let saved = card("u-1", &deck.id);
        store.save_card(&saved).await.unwrap();

        let loaded = store.get_card_by_uuid("u-1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.card_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut c = card("u-1", "d1");
        store.save_card(&c).await.unwrap();

        c.content = "changed".to_string();
        c.annotation_sources.clear();
        store.save_card(&c).await.unwrap();

        let loaded = store.get_card_by_uuid("u-1").await.unwrap().unwrap();
        assert_eq!(loaded.content, "changed");
        assert!(loaded.annotation_sources.is_empty());
        assert_eq!(store.card_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_card() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_card(&card("u-1", "d1")).await.unwrap();
        store.delete_card("u-1").await.unwrap();
        assert!(store.get_card_by_uuid("u-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_card_changes_deck() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut c = card("u-1", "d1");
        store.save_card(&c).await.unwrap();
        c.deck_id = "d2".to_string();
        store.move_card(&c, "d1").await.unwrap();
        assert_eq!(
            store.get_card_by_uuid("u-1").await.unwrap().unwrap().deck_id,
            "d2"
        );
    }

    #[tokio::test]
    async fn test_decks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.create_deck("Rust").await.unwrap();
        let again = store.create_deck("rust").await.unwrap();
        assert_eq!(a, again);
        store.create_deck("Go").await.unwrap();

        let names: Vec<String> = store
            .get_all_decks()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["Go".to_string(), "Rust".to_string()]);
        assert_eq!(store.find_deck_by_name("RUST").await.unwrap(), Some(a.clone()));
        assert_eq!(store.get_deck(&a.id).await.unwrap(), Some(a));
        assert!(store.find_deck_by_name("Python").await.unwrap().is_none());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("nested/cards.db")).unwrap();
        assert_eq!(store.schema_version().unwrap(), super::super::schema::SCHEMA_VERSION);
    }
}
