//! Shared setup for integration tests.
//!
//! `TestContext` wires an [`Orchestrator`] to in-memory stores, a recording
//! notifier and a manual clock, so passes are deterministic and every card
//! mutation and document write can be counted.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;

use annotation_core::Card;
use chrono::{Duration, TimeZone, Utc};

use annotation_sync::clock::ManualClock;
use annotation_sync::notification::RecordingNotifier;
use annotation_sync::store::{MemoryCardStore, MemoryDocumentStore};
use annotation_sync::{FileSyncReport, Orchestrator, SyncConfig, SyncOptions};

pub struct TestContext {
    pub docs: Arc<MemoryDocumentStore>,
    pub cards: Arc<MemoryCardStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Orchestrator,
}

impl TestContext {
    /// Watcher built but not started.
    pub async fn new() -> Self {
        Self::with_config(SyncConfig {
            auto_detect: false,
            ..Default::default()
        })
        .await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        Self::with_documents(config, &[]).await
    }

    /// Seed documents before the orchestrator initializes.
    pub async fn with_documents(config: SyncConfig, documents: &[(&str, &str)]) -> Self {
        let docs = Arc::new(MemoryDocumentStore::new());
        for (path, text) in documents {
            docs.insert(path, text);
        }
        let cards = Arc::new(MemoryCardStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));

        let mut orchestrator = Orchestrator::new(config)
            .with_document_store(docs.clone())
            .with_card_store(cards.clone())
            .with_deck_service(cards.clone())
            .with_notifier(notifier.clone())
            .with_clock(clock.clone());
        orchestrator
            .initialize()
            .await
            .expect("Failed to initialize orchestrator");

        Self {
            docs,
            cards,
            notifier,
            clock,
            orchestrator,
        }
    }

    pub async fn sync(&self, path: &str) -> FileSyncReport {
        self.orchestrator
            .sync_file(path, SyncOptions::default())
            .await
            .expect("sync_file failed")
    }

    pub fn doc(&self, path: &str) -> String {
        self.docs.get(path).expect("document missing")
    }

    /// The single card in the store.
    pub fn only_card(&self) -> Card {
        let cards = self.cards.cards();
        assert_eq!(cards.len(), 1, "expected exactly one card");
        cards.into_iter().next().unwrap()
    }

    pub fn advance_ms(&self, ms: i64) {
        self.clock.advance(Duration::milliseconds(ms));
    }

    /// Store writes plus card mutations so far.
    pub fn side_effects(&self) -> (usize, usize) {
        (self.docs.write_count(), self.cards.mutation_count())
    }
}
