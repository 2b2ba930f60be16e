//! Lifecycle owner: builds the engine and watcher from injected collaborators
//! and keeps operation statistics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use annotation_core::Annotation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigPatch, SyncConfig};
use crate::debounce::PassMode;
use crate::error::{Result, SyncError};
use crate::events::EngineEvent;
use crate::notification::{NotificationSink, TracingNotifier};
use crate::registry::{IdentityRegistry, RegistryStats};
use crate::store::{CardStore, DeckService, DocumentStore};
use crate::sync::{
    BatchReport, Collaborators, DocumentProcessor, FanOutReport, FileSyncReport, SyncEngine,
    SyncOptions,
};
use crate::watcher::FileWatcher;

const LOG_CAPACITY: usize = 200;
const MAX_ERROR_RATE: f64 = 0.1;

/// One tracked operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub operation: String,
    pub path: Option<String>,
    pub success: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub detected: usize,
    pub processed: usize,
    pub errors: usize,
    pub operations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Health {
    pub healthy: bool,
    /// Errors over processed annotations plus errors.
    pub error_rate: f64,
    pub log_size: usize,
}

/// Snapshot returned by [`Orchestrator::get_system_state`].
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub initialized: bool,
    pub config: SyncConfig,
    pub stats: OperationStats,
    pub health: Health,
    pub registry: RegistryStats,
    pub watcher_running: bool,
    pub pending_timers: usize,
    pub active_document: Option<String>,
}

#[derive(Debug, Default)]
struct Tracker {
    stats: OperationStats,
    log: VecDeque<LogEntry>,
}

impl Tracker {
    fn push(&mut self, entry: LogEntry) {
        self.stats.operations += 1;
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(entry);
    }

    fn record_report(&mut self, at: DateTime<Utc>, operation: &str, report: &FileSyncReport) {
        self.stats.detected += report.detected;
        self.stats.processed += report.processed();
        self.stats.errors += report.errors.len();
        self.push(LogEntry {
            at,
            operation: operation.to_string(),
            path: Some(report.path.clone()),
            success: report.errors.is_empty(),
            detail: report.errors.first().cloned(),
        });
    }

    fn record_failure(&mut self, at: DateTime<Utc>, operation: &str, path: Option<&str>, error: String) {
        self.stats.errors += 1;
        self.push(LogEntry {
            at,
            operation: operation.to_string(),
            path: path.map(str::to_string),
            success: false,
            detail: Some(error),
        });
    }

    fn health(&self, initialized: bool) -> Health {
        let attempts = self.stats.processed + self.stats.errors;
        let error_rate = if attempts == 0 {
            0.0
        } else {
            self.stats.errors as f64 / attempts as f64
        };
        Health {
            healthy: initialized && error_rate <= MAX_ERROR_RATE && self.log.len() <= LOG_CAPACITY,
            error_rate,
            log_size: self.log.len(),
        }
    }
}

type SharedTracker = Arc<Mutex<Tracker>>;

fn lock(tracker: &SharedTracker) -> MutexGuard<'_, Tracker> {
    tracker.lock().unwrap_or_else(|e| e.into_inner())
}

/// Records watcher-driven passes before handing them to the engine.
struct TrackedProcessor {
    engine: Arc<SyncEngine>,
    tracker: SharedTracker,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl DocumentProcessor for TrackedProcessor {
    async fn process_document(&self, path: &str, mode: PassMode) -> Result<FileSyncReport> {
        let operation = match mode {
            PassMode::Sync => "watch_sync",
            PassMode::DetectOnly => "watch_detect",
        };
        let result = self.engine.process_document(path, mode).await;
        let now = self.clock.now();
        match &result {
            Ok(report) => lock(&self.tracker).record_report(now, operation, report),
            Err(e) => lock(&self.tracker).record_failure(now, operation, Some(path), e.to_string()),
        }
        result
    }

    fn document_renamed(&self, from: &str, to: &str) -> usize {
        let moved = self.engine.document_renamed(from, to);
        lock(&self.tracker).push(LogEntry {
            at: self.clock.now(),
            operation: "rename".to_string(),
            path: Some(to.to_string()),
            success: true,
            detail: Some(format!("from {}, {} source(s) moved", from, moved)),
        });
        moved
    }

    fn document_deleted(&self, path: &str) {
        self.engine.document_deleted(path);
        lock(&self.tracker).push(LogEntry {
            at: self.clock.now(),
            operation: "delete".to_string(),
            path: Some(path.to_string()),
            success: true,
            detail: None,
        });
    }

    fn batch_completed(&self, report: &BatchReport) {
        self.engine.batch_completed(report);
    }
}

/// Top-level entry point.
///
/// Collaborators are injected with the `with_*` builders; [`initialize`]
/// constructs the registry, engine and watcher once.
///
/// [`initialize`]: Orchestrator::initialize
pub struct Orchestrator {
    config: RwLock<SyncConfig>,
    documents: Option<Arc<dyn DocumentStore>>,
    cards: Option<Arc<dyn CardStore>>,
    decks: Option<Arc<dyn DeckService>>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    engine: Option<Arc<SyncEngine>>,
    watcher: Option<FileWatcher>,
    tracker: SharedTracker,
}

impl Orchestrator {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config: RwLock::new(config.normalized()),
            documents: None,
            cards: None,
            decks: None,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
            engine: None,
            watcher: None,
            tracker: Arc::default(),
        }
    }

    pub fn with_document_store(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn with_card_store(mut self, cards: Arc<dyn CardStore>) -> Self {
        self.cards = Some(cards);
        self
    }

    pub fn with_deck_service(mut self, decks: Arc<dyn DeckService>) -> Self {
        self.decks = Some(decks);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> SyncConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// Build the engine and watcher. With `auto_detect` the watcher starts
    /// and an initial scan runs.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        let documents = self
            .documents
            .clone()
            .ok_or(SyncError::MissingCollaborator("document store"))?;
        let cards = self
            .cards
            .clone()
            .ok_or(SyncError::MissingCollaborator("card store"))?;
        let decks = self
            .decks
            .clone()
            .ok_or(SyncError::MissingCollaborator("deck service"))?;

        let config = self.config();
        let registry = Arc::new(IdentityRegistry::new(cards.clone()));
        let engine = Arc::new(SyncEngine::new(
            Collaborators {
                documents: documents.clone(),
                cards,
                decks,
                notifier: self.notifier.clone(),
                clock: self.clock.clone(),
            },
            registry,
            config.clone(),
        ));
        let processor = Arc::new(TrackedProcessor {
            engine: engine.clone(),
            tracker: self.tracker.clone(),
            clock: self.clock.clone(),
        });
        let watcher = FileWatcher::new(documents, processor, self.clock.clone(), config.clone());

        if config.auto_detect {
            watcher.start()?;
            watcher.initial_scan().await?;
        }

        self.engine = Some(engine);
        self.watcher = Some(watcher);
        info!(auto_detect = config.auto_detect, "orchestrator initialized");
        Ok(())
    }

    /// Stop the watcher and drop the engine. Registry state is discarded.
    pub fn destroy(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(engine) = self.engine.take() {
            engine.registry().clear_cache();
        }
        info!("orchestrator destroyed");
    }

    fn engine(&self) -> Result<&Arc<SyncEngine>> {
        self.engine.as_ref().ok_or(SyncError::NotInitialized)
    }

    pub fn watcher(&self) -> Option<&FileWatcher> {
        self.watcher.as_ref()
    }

    pub fn registry(&self) -> Option<Arc<IdentityRegistry>> {
        self.engine.as_ref().map(|e| e.registry().clone())
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<EngineEvent>> {
        Ok(self.engine()?.subscribe())
    }

    pub async fn detect_annotations(&self, path: &str) -> Result<Vec<Annotation>> {
        let result = self.engine()?.detect(path).await;
        let now = self.clock.now();
        let mut tracker = lock(&self.tracker);
        match &result {
            Ok(annotations) => {
                tracker.stats.detected += annotations.len();
                tracker.push(LogEntry {
                    at: now,
                    operation: "detect".to_string(),
                    path: Some(path.to_string()),
                    success: true,
                    detail: None,
                });
            }
            Err(e) => tracker.record_failure(now, "detect", Some(path), e.to_string()),
        }
        result
    }

    pub async fn sync_file(&self, path: &str, options: SyncOptions) -> Result<FileSyncReport> {
        let result = self.engine()?.sync_document(path, options).await;
        let now = self.clock.now();
        match &result {
            Ok(report) => lock(&self.tracker).record_report(now, "sync", report),
            Err(e) => {
                warn!(path, error = %e, "sync failed");
                lock(&self.tracker).record_failure(now, "sync", Some(path), e.to_string());
            }
        }
        result
    }

    pub async fn sync_multiple_files(&self, paths: &[String]) -> Result<BatchReport> {
        let batch = self
            .engine()?
            .sync_many(paths, SyncOptions::default())
            .await;
        let now = self.clock.now();
        let mut tracker = lock(&self.tracker);
        for report in &batch.files {
            tracker.record_report(now, "sync", report);
        }
        for (path, error) in &batch.failed {
            tracker.record_failure(now, "sync", Some(path), error.clone());
        }
        Ok(batch)
    }

    /// Sync every document in the store with a watched extension.
    pub async fn sync_all(&self) -> Result<BatchReport> {
        let documents = self
            .documents
            .as_ref()
            .ok_or(SyncError::MissingCollaborator("document store"))?;
        let config = self.config();
        let mut paths = documents.list().await?;
        paths.retain(|p| config.matches_extension(p));
        self.sync_multiple_files(&paths).await
    }

    pub async fn push_card_to_documents(&self, uuid: &str) -> Result<FanOutReport> {
        let result = self.engine()?.push_card_to_documents(uuid).await;
        let now = self.clock.now();
        let mut tracker = lock(&self.tracker);
        match &result {
            Ok(report) => tracker.push(LogEntry {
                at: now,
                operation: "push_card".to_string(),
                path: None,
                success: report.failed == 0,
                detail: Some(format!("{} written, {} stale", report.written, report.stale.len())),
            }),
            Err(e) => tracker.record_failure(now, "push_card", None, e.to_string()),
        }
        result
    }

    pub async fn handle_card_deleted(&self, uuid: &str) -> Result<usize> {
        let result = self.engine()?.handle_card_deleted(uuid).await;
        let now = self.clock.now();
        let mut tracker = lock(&self.tracker);
        match &result {
            Ok(demoted) => tracker.push(LogEntry {
                at: now,
                operation: "card_deleted".to_string(),
                path: None,
                success: true,
                detail: Some(format!("{} annotation(s) demoted", demoted)),
            }),
            Err(e) => tracker.record_failure(now, "card_deleted", None, e.to_string()),
        }
        result
    }

    pub fn set_active_document(&self, path: Option<String>) {
        if let Some(watcher) = &self.watcher {
            watcher.set_active_document(path);
        }
    }

    /// Apply a partial config. Toggling `auto_detect` starts or stops the
    /// watcher; stopping drops every pending timer.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<SyncConfig> {
        let updated = {
            let mut config = match self.config.write() {
                Ok(config) => config,
                Err(e) => e.into_inner(),
            };
            config.apply(patch);
            config.clone()
        };

        if let Some(engine) = &self.engine {
            engine.set_config(updated.clone());
        }
        if let Some(watcher) = &self.watcher {
            watcher.update_config(updated.clone());
            match (updated.auto_detect, watcher.is_running()) {
                (true, false) => watcher.start()?,
                (false, true) => watcher.stop(),
                _ => {}
            }
        }
        info!(?patch, "config updated");
        Ok(updated)
    }

    pub fn operation_log(&self) -> Vec<LogEntry> {
        lock(&self.tracker).log.iter().cloned().collect()
    }

    pub fn get_system_state(&self) -> SystemState {
        let initialized = self.is_initialized();
        let tracker = lock(&self.tracker);
        SystemState {
            initialized,
            config: self.config(),
            stats: tracker.stats,
            health: tracker.health(initialized),
            registry: self
                .engine
                .as_ref()
                .map(|e| e.registry().stats())
                .unwrap_or_default(),
            watcher_running: self.watcher.as_ref().map_or(false, FileWatcher::is_running),
            pending_timers: self.watcher.as_ref().map_or(0, FileWatcher::pending),
            active_document: self.watcher.as_ref().and_then(FileWatcher::active_document),
        }
    }
}
