//! Local SQLite card and deck storage.

pub mod repository;
pub mod schema;

pub use repository::SqliteStore;
