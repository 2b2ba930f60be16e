//! SQLite schema definitions.

/// Current schema version for migrations.
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema for the local card database.
pub const SCHEMA: &str = r#"
-- Decks
CREATE TABLE IF NOT EXISTS decks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    created_at TEXT NOT NULL
);

-- Cards, identified by the uuid written into their annotation blocks
CREATE TABLE IF NOT EXISTS cards (
    id TEXT PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE,
    deck_id TEXT NOT NULL,
    content TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'basic',
    template_id TEXT,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL
);

-- Document locations referencing a card
CREATE TABLE IF NOT EXISTS annotation_sources (
    card_uuid TEXT NOT NULL,
    document_path TEXT NOT NULL,
    block_anchor TEXT NOT NULL,
    last_sync TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    PRIMARY KEY (card_uuid, document_path, block_anchor)
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_cards_deck ON cards(deck_id);
CREATE INDEX IF NOT EXISTS idx_sources_path ON annotation_sources(document_path);
"#;

/// Record the schema version if not already present.
pub const INIT_SCHEMA_VERSION: &str = r#"
INSERT OR IGNORE INTO schema_version (version) VALUES (1);
"#;
