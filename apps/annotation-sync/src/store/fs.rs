//! Filesystem document store with change notifications.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;

use super::{DocumentEvent, DocumentStore};
use crate::error::StoreError;

/// Documents under a root directory, addressed by relative `/`-separated paths.
pub struct FsDocumentStore {
    root: PathBuf,
    extensions: Vec<String>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        let root = root.into();
        // Watch events carry canonical paths on some platforms.
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            extensions,
            watcher: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn has_extension(extensions: &[String], path: &Path) -> bool {
    path.extension()
        .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e.as_str())))
        .unwrap_or(false)
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Recursively collect document paths relative to `base`.
fn collect_documents(
    base: &Path,
    current: &Path,
    extensions: &[String],
    files: &mut Vec<String>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(current)? {
        let path = entry?.path();
        if is_hidden(&path) {
            continue;
        }
        if path.is_dir() {
            collect_documents(base, &path, extensions, files)?;
        } else if has_extension(extensions, &path) {
            if let Some(rel) = relative(base, &path) {
                files.push(rel);
            }
        }
    }
    Ok(())
}

/// Translate a raw watcher event into document events.
fn map_event(root: &Path, extensions: &[String], event: &Event) -> Vec<DocumentEvent> {
    let docs = |paths: &[PathBuf]| -> Vec<String> {
        paths
            .iter()
            .filter(|p| has_extension(extensions, p))
            .filter_map(|p| relative(root, p))
            .collect()
    };

    match &event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => docs(&event.paths)
            .into_iter()
            .map(DocumentEvent::Created)
            .collect(),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => docs(&event.paths)
            .into_iter()
            .map(DocumentEvent::Modified)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let from = docs(&event.paths[..1]).pop();
            let to = docs(&event.paths[1..]).pop();
            match (from, to) {
                (Some(from), Some(to)) => vec![DocumentEvent::Renamed { from, to }],
                (None, Some(to)) => vec![DocumentEvent::Created(to)],
                (Some(from), None) => vec![DocumentEvent::Deleted(from)],
                (None, None) => vec![],
            }
        }
        // Platforms that cannot pair rename halves report each side alone.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => event
            .paths
            .iter()
            .filter(|p| has_extension(extensions, p))
            .filter_map(|p| {
                let rel = relative(root, p)?;
                Some(if p.exists() {
                    DocumentEvent::Created(rel)
                } else {
                    DocumentEvent::Deleted(rel)
                })
            })
            .collect(),
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => docs(&event.paths)
            .into_iter()
            .map(DocumentEvent::Deleted)
            .collect(),
        _ => vec![],
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read(&self, path: &str) -> Result<String, StoreError> {
        Ok(tokio::fs::read_to_string(self.resolve(path)).await?)
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), StoreError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, content).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        let extensions = self.extensions.clone();
        let mut files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            collect_documents(&root, &root, &extensions, &mut files).map(|_| files)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("listing task failed: {}", e)))??;
        files.sort();
        Ok(files)
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.resolve(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<DocumentEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let root = self.root.clone();
        let extensions = self.extensions.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    for doc_event in map_event(&root, &extensions, &event) {
                        let _ = tx.send(doc_event);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| StoreError::Backend(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| StoreError::Backend(format!("Failed to watch directory: {}", e)))?;

        let mut slot = self
            .watcher
            .lock()
            .map_err(|_| StoreError::Backend("watcher lock poisoned".to_string()))?;
        *slot = Some(watcher);

        tracing::info!(root = %self.root.display(), "watching documents");
        Ok(rx)
    }

    fn unsubscribe(&self) {
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = None;
        }
    }
}
