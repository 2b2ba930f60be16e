//! Error types for the sync application.

use annotation_core::{ExtractionError, ModifyError, WriteValidationFailure};
use thiserror::Error;

/// Failures of a collaborator store (documents, cards, decks).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Document error in {path}: {source}")]
    Document {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Modify error: {0}")]
    Modify(#[from] ModifyError),

    #[error("Write validation failed for {path}: {failure}")]
    WriteValidation {
        path: String,
        failure: WriteValidationFailure,
    },

    #[error("Write of {path} did not read back as written; original restored")]
    WriteMismatch { path: String },

    #[error("Identity conflict in {path}: {detail}")]
    IdentityConflict { path: String, detail: String },

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("Not initialized")]
    NotInitialized,

    #[error("Watcher error: {0}")]
    Watcher(String),
}

impl SyncError {
    pub fn document(path: &str, source: StoreError) -> Self {
        Self::Document {
            path: path.to_string(),
            source,
        }
    }

    /// Whether the failure came from the card or deck store.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<notify::Error> for SyncError {
    fn from(e: notify::Error) -> Self {
        Self::Watcher(e.to_string())
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_missing_collaborator() {
        let error = SyncError::MissingCollaborator("document store");
        assert_eq!(error.to_string(), "Missing collaborator: document store");
    }

    #[test]
    fn test_error_display_document() {
        let error = SyncError::document("a.md", StoreError::NotFound("a.md".to_string()));
        assert_eq!(error.to_string(), "Document error in a.md: not found: a.md");
    }

    #[test]
    fn test_error_display_identity_conflict() {
        let error = SyncError::IdentityConflict {
            path: "a.md".to_string(),
            detail: "uuid u-1 appears twice".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Identity conflict in a.md: uuid u-1 appears twice"
        );
    }

    #[test]
    fn test_store_failure_classification() {
        assert!(SyncError::Store(StoreError::Backend("down".to_string())).is_store_failure());
        assert!(!SyncError::NotInitialized.is_store_failure());
    }

    #[test]
    fn test_modify_error_converts() {
        let error: SyncError = ModifyError::BlockNotFound { line: 3 }.into();
        assert!(matches!(error, SyncError::Modify(_)));
    }
}
