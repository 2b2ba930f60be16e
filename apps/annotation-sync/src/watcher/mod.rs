//! Document watcher: debounces store events into sync passes.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::debounce::{Debouncer, PassMode};
use crate::error::Result;
use crate::store::{DocumentEvent, DocumentStore};
use crate::sync::{run_batch, BatchReport, DocumentProcessor};

const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
struct WatchState {
    config: SyncConfig,
    active_document: Option<String>,
}

struct WatcherCore {
    docs: Arc<dyn DocumentStore>,
    processor: Arc<dyn DocumentProcessor>,
    clock: Arc<dyn Clock>,
    state: RwLock<WatchState>,
    debouncer: Mutex<Debouncer>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl WatcherCore {
    fn state(&self) -> WatchState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    async fn handle_event(&self, event: DocumentEvent) {
        let state = self.state();
        let config = &state.config;

        match event {
            DocumentEvent::Created(path) => {
                if config.matches_extension(&path) {
                    debug!(path = %path, "document created");
                    lock(&self.debouncer).schedule_first_pass(&path, self.clock.now());
                }
            }
            DocumentEvent::Modified(path) => {
                if !config.matches_extension(&path) {
                    return;
                }
                if config.active_document_only
                    && state.active_document.as_deref() != Some(path.as_str())
                {
                    debug!(path = %path, "ignoring inactive document");
                    return;
                }
                let mode = if config.auto_sync {
                    PassMode::Sync
                } else {
                    PassMode::DetectOnly
                };
                lock(&self.debouncer).schedule(&path, mode, self.clock.now());
            }
            DocumentEvent::Deleted(path) => {
                if lock(&self.debouncer).cancel(&path) {
                    debug!(path = %path, "pending pass cancelled");
                }
                if config.matches_extension(&path) {
                    self.processor.document_deleted(&path);
                }
            }
            DocumentEvent::Renamed { from, to } => {
                lock(&self.debouncer).rename(&from, &to);
                self.processor.document_renamed(&from, &to);
            }
        }
    }

    async fn flush_due(&self) -> usize {
        let due = lock(&self.debouncer).take_due(self.clock.now());
        let count = due.len();
        for (path, mode) in due {
            match self.processor.process_document(&path, mode).await {
                Ok(report) => debug!(path = %path, ?mode, detected = report.detected, "debounced pass done"),
                Err(e) => warn!(path = %path, error = %e, "debounced pass failed"),
            }
        }
        count
    }
}

/// Watches a document store and runs debounced passes through a processor.
pub struct FileWatcher {
    core: Arc<WatcherCore>,
    running: Mutex<Option<Running>>,
}

impl FileWatcher {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        processor: Arc<dyn DocumentProcessor>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let debouncer = Debouncer::new(config.debounce_ms);
        Self {
            core: Arc::new(WatcherCore {
                docs,
                processor,
                clock,
                state: RwLock::new(WatchState {
                    config,
                    active_document: None,
                }),
                debouncer: Mutex::new(debouncer),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Subscribe to the store and spawn the event loop. No-op if running.
    pub fn start(&self) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }

        let events = self.core.docs.subscribe()?;
        let (shutdown, stop_rx) = oneshot::channel();
        let core = self.core.clone();
        let task = tokio::spawn(event_loop(core, events, stop_rx));

        *running = Some(Running { shutdown, task });
        info!("watcher started");
        Ok(())
    }

    /// Stop the loop and drop every pending timer. A pass already underway
    /// finishes on its own.
    pub fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        let _ = running.shutdown.send(());
        drop(running.task);
        self.core.docs.unsubscribe();
        lock(&self.core.debouncer).clear();
        info!("watcher stopped");
    }

    /// Feed one event as if it came from the store.
    pub async fn handle_event(&self, event: DocumentEvent) {
        self.core.handle_event(event).await;
    }

    /// Run every pass whose debounce deadline has passed. Returns how many ran.
    pub async fn flush_due(&self) -> usize {
        self.core.flush_due().await
    }

    pub fn pending(&self) -> usize {
        lock(&self.core.debouncer).pending()
    }

    pub fn is_pending(&self, path: &str) -> bool {
        lock(&self.core.debouncer).is_pending(path)
    }

    pub fn update_config(&self, config: SyncConfig) {
        lock(&self.core.debouncer).set_delay(config.debounce_ms);
        match self.core.state.write() {
            Ok(mut state) => state.config = config,
            Err(e) => e.into_inner().config = config,
        }
    }

    pub fn set_active_document(&self, path: Option<String>) {
        match self.core.state.write() {
            Ok(mut state) => state.active_document = path,
            Err(e) => e.into_inner().active_document = path,
        }
    }

    pub fn active_document(&self) -> Option<String> {
        self.core.state().active_document
    }

    /// Pass over every matching document in the store.
    ///
    /// Detect-only unless the config asks for a full sync at startup.
    pub async fn initial_scan(&self) -> Result<BatchReport> {
        let config = self.core.state().config;
        let mut paths = self.core.docs.list().await?;
        paths.retain(|p| config.matches_extension(p));

        let mode = if config.initial_scan_auto_sync {
            PassMode::Sync
        } else {
            PassMode::DetectOnly
        };
        let processor = &self.core.processor;
        let batch = run_batch(&paths, config.concurrency, |p| {
            processor.process_document(p, mode)
        })
        .await;

        info!(
            documents = batch.files.len(),
            failed = batch.failed.len(),
            ?mode,
            "initial scan finished"
        );
        processor.batch_completed(&batch);
        Ok(batch)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                let _ = running.shutdown.send(());
            }
        }
    }
}

async fn event_loop(
    core: Arc<WatcherCore>,
    mut events: mpsc::UnboundedReceiver<DocumentEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(event) => core.handle_event(event).await,
                None => {
                    debug!("document event stream closed");
                    break;
                }
            },
            _ = tick.tick() => {
                core.flush_due().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sync::FileSyncReport;
    use crate::store::MemoryDocumentStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    #[derive(Default)]
    struct RecordingProcessor {
        passes: Mutex<Vec<(String, PassMode)>>,
        renames: Mutex<Vec<(String, String)>>,
        deletes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DocumentProcessor for RecordingProcessor {
        async fn process_document(&self, path: &str, mode: PassMode) -> Result<FileSyncReport> {
            self.passes.lock().unwrap().push((path.to_string(), mode));
            Ok(FileSyncReport::new(path))
        }

        fn document_renamed(&self, from: &str, to: &str) -> usize {
            self.renames
                .lock()
                .unwrap()
                .push((from.to_string(), to.to_string()));
            0
        }

        fn document_deleted(&self, path: &str) {
            self.deletes.lock().unwrap().push(path.to_string());
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        processor: Arc<RecordingProcessor>,
        watcher: FileWatcher,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let docs = Arc::new(MemoryDocumentStore::new());
        docs.insert("a.md", "text");
        docs.insert("b.md", "text");
        docs.insert("c.txt", "text");
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let processor = Arc::new(RecordingProcessor::default());
        let watcher = FileWatcher::new(docs, processor.clone(), clock.clone(), config);
        Fixture {
            clock,
            processor,
            watcher,
        }
    }

    fn modified(path: &str) -> DocumentEvent {
        DocumentEvent::Modified(path.to_string())
    }

    #[tokio::test]
    async fn test_burst_of_edits_runs_one_pass() {
        let f = fixture(SyncConfig::default());
        for _ in 0..5 {
            f.watcher.handle_event(modified("a.md")).await;
            f.clock.advance(chrono::Duration::milliseconds(200));
        }
        assert_eq!(f.watcher.flush_due().await, 0);

        f.clock.advance(chrono::Duration::milliseconds(1000));
        assert_eq!(f.watcher.flush_due().await, 1);
        assert_eq!(
            *f.processor.passes.lock().unwrap(),
            vec![("a.md".to_string(), PassMode::Sync)]
        );
    }

    #[tokio::test]
    async fn test_created_is_detect_only() {
        let f = fixture(SyncConfig::default());
        f.watcher
            .handle_event(DocumentEvent::Created("new.md".to_string()))
            .await;
        f.clock.advance(chrono::Duration::seconds(2));
        f.watcher.flush_due().await;
        assert_eq!(
            *f.processor.passes.lock().unwrap(),
            vec![("new.md".to_string(), PassMode::DetectOnly)]
        );
    }

    #[tokio::test]
    async fn test_auto_sync_off_downgrades_to_detect() {
        let f = fixture(SyncConfig {
            auto_sync: false,
            ..Default::default()
        });
        f.watcher.handle_event(modified("a.md")).await;
        f.clock.advance(chrono::Duration::seconds(2));
        f.watcher.flush_due().await;
        assert_eq!(f.processor.passes.lock().unwrap()[0].1, PassMode::DetectOnly);
    }

    #[tokio::test]
    async fn test_extension_filter() {
        let f = fixture(SyncConfig::default());
        f.watcher.handle_event(modified("c.txt")).await;
        assert_eq!(f.watcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_active_document_only() {
        let f = fixture(SyncConfig {
            active_document_only: true,
            ..Default::default()
        });
        f.watcher.set_active_document(Some("b.md".to_string()));
        f.watcher.handle_event(modified("a.md")).await;
        f.watcher.handle_event(modified("b.md")).await;
        assert!(!f.watcher.is_pending("a.md"));
        assert!(f.watcher.is_pending("b.md"));
    }

    #[tokio::test]
    async fn test_delete_cancels_pending_pass() {
        let f = fixture(SyncConfig::default());
        f.watcher.handle_event(modified("a.md")).await;
        f.watcher
            .handle_event(DocumentEvent::Deleted("a.md".to_string()))
            .await;
        f.clock.advance(chrono::Duration::seconds(5));
        assert_eq!(f.watcher.flush_due().await, 0);
        assert_eq!(*f.processor.deletes.lock().unwrap(), vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_moves_pending_pass() {
        let f = fixture(SyncConfig::default());
        f.watcher.handle_event(modified("a.md")).await;
        f.watcher
            .handle_event(DocumentEvent::Renamed {
                from: "a.md".to_string(),
                to: "z.md".to_string(),
            })
            .await;
        f.clock.advance(chrono::Duration::seconds(2));
        f.watcher.flush_due().await;
        assert_eq!(f.processor.passes.lock().unwrap()[0].0, "z.md");
        assert_eq!(f.processor.renames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_initial_scan_is_detect_only_by_default() {
        let f = fixture(SyncConfig::default());
        let batch = f.watcher.initial_scan().await.unwrap();
        assert_eq!(batch.files.len(), 2);
        assert!(f
            .processor
            .passes
            .lock()
            .unwrap()
            .iter()
            .all(|(_, mode)| *mode == PassMode::DetectOnly));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let f = fixture(SyncConfig::default());
        f.watcher.start().unwrap();
        assert!(f.watcher.is_running());
        f.watcher.handle_event(modified("a.md")).await;
        f.watcher.stop();
        assert!(!f.watcher.is_running());
        assert_eq!(f.watcher.pending(), 0);
    }
}
