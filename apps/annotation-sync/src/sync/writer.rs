//! Validated, read-back-checked document writes.

use std::sync::Arc;

use annotation_core::{validate, ModifyError, WriteCheck};

use crate::error::{Result, SyncError};
use crate::store::DocumentStore;

/// Read-modify-write wrapper around a document store.
///
/// The original text is kept as a snapshot. A modification that fails
/// validation is never written; a write that does not read back as written
/// is rolled back to the snapshot.
#[derive(Clone)]
pub struct DocumentWriter {
    docs: Arc<dyn DocumentStore>,
}

impl DocumentWriter {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    pub async fn read(&self, path: &str) -> Result<String> {
        self.docs
            .read(path)
            .await
            .map_err(|e| SyncError::document(path, e))
    }

    /// Apply `modify` to the current text of `path`.
    ///
    /// Returns the new text if it was written, `None` if the modification
    /// left the document unchanged.
    pub async fn apply<F>(&self, path: &str, check: &WriteCheck, modify: F) -> Result<Option<String>>
    where
        F: FnOnce(&str) -> std::result::Result<String, ModifyError>,
    {
        let snapshot = self.read(path).await?;
        let modified = modify(&snapshot)?;
        if modified == snapshot {
            return Ok(None);
        }

        validate(&snapshot, &modified, check).map_err(|failure| {
            tracing::warn!(path, %failure, "refusing document write");
            SyncError::WriteValidation {
                path: path.to_string(),
                failure,
            }
        })?;

        self.docs
            .write(path, &modified)
            .await
            .map_err(|e| SyncError::document(path, e))?;

        match self.docs.read(path).await {
            Ok(text) if text == modified => Ok(Some(modified)),
            _ => {
                tracing::error!(path, "write did not read back; restoring snapshot");
                if let Err(e) = self.docs.write(path, &snapshot).await {
                    tracing::error!(path, error = %e, "failed to restore snapshot");
                }
                Err(SyncError::WriteMismatch {
                    path: path.to_string(),
                })
            }
        }
    }
}
