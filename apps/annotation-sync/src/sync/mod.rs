//! Sync engine: reconciles annotation blocks with card records.
//!
//! Per annotation the engine walks a small state machine:
//! - no uuid: create a card and write identity metadata into the block
//! - uuid with a card: compare, then either nothing or update + fan-out
//! - uuid without a card: demote the block to a plain note

pub mod guards;
pub mod report;
pub mod writer;

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};

use annotation_core::block::{anchor_of, find_block_by_anchor, scan_blocks};
use annotation_core::{
    annotate, cleanup_block, insert_or_update_metadata, replace_block_body, Annotation,
    AnnotationMetadata, AnnotationSource, BlockHint, Card, Deck, LineRange, ModifyError,
    WriteCheck,
};
use async_trait::async_trait;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::debounce::PassMode;
use crate::error::{Result, StoreError, SyncError};
use crate::events::{AnnotationChange, EngineEvent};
use crate::notification::{NotificationLevel, NotificationSink};
use crate::registry::IdentityRegistry;
use crate::store::{CardStore, DeckService, DocumentStore};

pub use guards::{Guard, GuardSet, InFlightKey};
pub use report::{BatchReport, FanOutReport, FileSyncReport};
pub use writer::DocumentWriter;

const EVENT_CAPACITY: usize = 256;
const ANCHOR_PREFIX: &str = "tk-";

/// Per-call switches for a document pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Process annotations that would otherwise be skipped as identity conflicts.
    pub force: bool,
    /// Only detect and register identities.
    pub detect_only: bool,
}

impl SyncOptions {
    pub fn detect_only() -> Self {
        Self {
            detect_only: true,
            ..Default::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }
}

/// SHA-256 hex digest of card content.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Anchor derived from `uuid`, e.g. `tk-0b6c1e0e`, that no block in `taken`
/// uses yet.
///
/// Widens the uuid prefix on a clash and falls back to a numeric suffix.
pub fn unique_anchor(uuid: &str, taken: &HashSet<String>) -> String {
    let hex: String = uuid
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let mut len = hex.len().min(8);
    loop {
        let candidate = format!("{}{}", ANCHOR_PREFIX, &hex[..len]);
        if !taken.contains(&candidate) {
            return candidate;
        }
        if len == hex.len() {
            break;
        }
        len = (len + 4).min(hex.len());
    }

    let base = format!("{}{}", ANCHOR_PREFIX, hex);
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn document_anchors(text: &str) -> HashSet<String> {
    let lines: Vec<&str> = text.lines().collect();
    let (spans, _) = scan_blocks(&lines);
    spans
        .iter()
        .filter_map(|span| anchor_of(&lines, span))
        .collect()
}

fn locate_range(text: &str, anchor: &str) -> Option<LineRange> {
    let lines: Vec<&str> = text.lines().collect();
    find_block_by_anchor(&lines, anchor).map(|span| LineRange {
        start: span.start,
        end: span.end,
    })
}

/// Byte length of the block carrying `anchor`, 0 if absent.
fn block_len(text: &str, anchor: &str) -> usize {
    let lines: Vec<&str> = text.lines().collect();
    find_block_by_anchor(&lines, anchor)
        .map(|span| lines[span.start..=span.end].iter().map(|l| l.len() + 1).sum())
        .unwrap_or(0)
}

/// Index-aligned conflict reasons for one document's annotations.
///
/// The first occurrence wins: a repeated uuid, or a new block repeating
/// content already seen above it, is flagged.
fn find_conflicts(annotations: &[Annotation]) -> Vec<Option<String>> {
    let mut seen_uuids = HashSet::new();
    let mut seen_hashes = HashSet::new();
    annotations
        .iter()
        .map(|ann| {
            let hash = hash_content(&ann.card_content);
            let conflict = match ann.uuid() {
                Some(uuid) => (!seen_uuids.insert(uuid.to_string()))
                    .then(|| format!("uuid {} appears more than once", uuid)),
                None => seen_hashes
                    .contains(&hash)
                    .then(|| "new block duplicates another block's content".to_string()),
            };
            seen_hashes.insert(hash);
            conflict
        })
        .collect()
}

/// Run passes over `paths` in batches of `concurrency`. A failing document
/// never stops the others.
pub async fn run_batch<'a, F, Fut>(paths: &'a [String], concurrency: usize, pass: F) -> BatchReport
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = Result<FileSyncReport>>,
{
    let mut batch = BatchReport::default();
    for chunk in paths.chunks(concurrency.max(1)) {
        let results = join_all(chunk.iter().map(|p| pass(p.as_str()))).await;
        for (path, result) in chunk.iter().zip(results) {
            match result {
                Ok(report) => batch.push(report),
                Err(e) => {
                    warn!(path = %path, error = %e, "document pass failed");
                    batch.push_failure(path, e.to_string());
                }
            }
        }
    }
    batch
}

/// Seam between the file watcher and whatever processes documents.
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    async fn process_document(&self, path: &str, mode: PassMode) -> Result<FileSyncReport>;

    /// Returns the number of tracked sources moved to the new path.
    fn document_renamed(&self, from: &str, to: &str) -> usize;

    fn document_deleted(&self, path: &str);

    fn batch_completed(&self, _report: &BatchReport) {}
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn DocumentStore>,
    pub cards: Arc<dyn CardStore>,
    pub decks: Arc<dyn DeckService>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

enum Outcome {
    Created,
    Updated,
    Unchanged,
    Skipped,
    Orphaned,
}

enum DeckChange {
    Keep,
    Move(Deck),
    Missing(String),
}

/// Bidirectional annotation/card reconciliation.
pub struct SyncEngine {
    docs: Arc<dyn DocumentStore>,
    cards: Arc<dyn CardStore>,
    decks: Arc<dyn DeckService>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    registry: Arc<IdentityRegistry>,
    writer: DocumentWriter,
    config: RwLock<SyncConfig>,
    in_flight: GuardSet<InFlightKey>,
    syncing: GuardSet<String>,
    events: broadcast::Sender<EngineEvent>,
}

impl SyncEngine {
    pub fn new(parts: Collaborators, registry: Arc<IdentityRegistry>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            writer: DocumentWriter::new(parts.documents.clone()),
            docs: parts.documents,
            cards: parts.cards,
            decks: parts.decks,
            notifier: parts.notifier,
            clock: parts.clock,
            registry,
            config: RwLock::new(config),
            in_flight: GuardSet::new(),
            syncing: GuardSet::new(),
            events,
        }
    }

    pub fn config(&self) -> SyncConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_config(&self, config: SyncConfig) {
        match self.config.write() {
            Ok(mut current) => *current = config,
            Err(e) => *e.into_inner() = config,
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_change(&self, path: &str, uuid: &str, change: AnnotationChange) {
        self.emit(EngineEvent::AnnotationChanged {
            path: path.to_string(),
            uuid: uuid.to_string(),
            change,
        });
    }

    fn source_for(&self, ann: &Annotation, anchor: &str) -> AnnotationSource {
        AnnotationSource {
            document_path: ann.position.document_path.clone(),
            block_anchor: anchor.to_string(),
            last_sync: self.clock.now(),
            line_range: ann.position.line_range(),
        }
    }

    /// Detect annotations without touching anything.
    pub async fn detect(&self, path: &str) -> Result<Vec<Annotation>> {
        let text = self.writer.read(path).await?;
        let scan = annotate(&text, path, self.clock.now());
        for diagnostic in &scan.diagnostics {
            warn!(path, %diagnostic, "annotation block dropped");
        }
        Ok(scan.annotations)
    }

    /// One full pass over a document.
    pub async fn sync_document(&self, path: &str, options: SyncOptions) -> Result<FileSyncReport> {
        let text = self.writer.read(path).await?;
        let scan = annotate(&text, path, self.clock.now());
        for diagnostic in &scan.diagnostics {
            warn!(path, %diagnostic, "annotation block dropped");
        }
        for (block, e) in &scan.rejected {
            debug!(path, line = block.position.start_line, error = %e, "block rejected");
        }

        let mut report = FileSyncReport::new(path);
        report.detected = scan.annotations.len();
        report.rejected = scan.rejected.len();

        if options.detect_only {
            for ann in &scan.annotations {
                if let (Some(uuid), Some(anchor)) = (ann.uuid(), ann.block_anchor()) {
                    self.registry
                        .register_annotation(uuid, self.source_for(ann, anchor));
                }
            }
            debug!(path, detected = report.detected, "detect-only pass");
            return Ok(report);
        }

        let conflicts = find_conflicts(&scan.annotations);

        // Bottom-up, so metadata inserted below never shifts a block still to come.
        for (ann, conflict) in scan.annotations.iter().zip(conflicts).rev() {
            if let Some(detail) = conflict {
                if !options.force {
                    let conflict = SyncError::IdentityConflict {
                        path: path.to_string(),
                        detail,
                    };
                    warn!(line = ann.position.start_line, error = %conflict, "skipping annotation");
                    report.skipped += 1;
                    continue;
                }
            }

            match self.process_annotation(path, ann).await {
                Ok(Outcome::Created) => report.created += 1,
                Ok(Outcome::Updated) => report.updated += 1,
                Ok(Outcome::Unchanged) => report.unchanged += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Ok(Outcome::Orphaned) => report.orphaned += 1,
                Err(e) => {
                    error!(path, line = ann.position.start_line, error = %e, "annotation sync failed");
                    if e.is_store_failure() {
                        self.notifier.notify(
                            &format!("Card store error while syncing {}: {}", path, e),
                            NotificationLevel::Error,
                        );
                    }
                    report
                        .errors
                        .push(format!("line {}: {}", ann.position.start_line + 1, e));
                }
            }
        }

        if report.is_noop() {
            debug!(path, unchanged = report.unchanged, "document in sync");
        } else {
            info!(
                path,
                created = report.created,
                updated = report.updated,
                orphaned = report.orphaned,
                "document synced"
            );
        }
        Ok(report)
    }

    /// Sync several documents with bounded concurrency.
    pub async fn sync_many(&self, paths: &[String], options: SyncOptions) -> BatchReport {
        let concurrency = self.config().concurrency;
        let batch = run_batch(paths, concurrency, |p| self.sync_document(p, options)).await;
        self.emit(EngineEvent::BatchCompleted {
            files: batch.files.len(),
            failed: batch.failed.len(),
        });
        batch
    }

    async fn process_annotation(&self, path: &str, ann: &Annotation) -> Result<Outcome> {
        let key = InFlightKey {
            path: path.to_string(),
            start_line: ann.position.start_line,
            anchor: ann.block_anchor().map(str::to_string),
            uuid: ann.uuid().map(str::to_string),
        };
        let Some(_in_flight) = self.in_flight.try_acquire(key) else {
            debug!(path, line = ann.position.start_line, "annotation already in flight");
            return Ok(Outcome::Skipped);
        };

        let Some(uuid) = ann.uuid() else {
            return self.create_card(path, ann).await;
        };

        let Some(_syncing) = self.syncing.try_acquire(uuid.to_string()) else {
            debug!(path, uuid, "card already syncing");
            return Ok(Outcome::Skipped);
        };

        match self.registry.load_card(uuid).await? {
            Some(card) => self.reconcile(path, ann, card).await,
            None => self.cleanup_orphan(path, ann, uuid).await,
        }
    }

    async fn resolve_deck_for_create(&self, hint: Option<&str>, config: &SyncConfig) -> Result<Deck> {
        if let Some(name) = hint {
            if let Some(deck) = self.decks.find_deck_by_name(name).await? {
                return Ok(deck);
            }
            if config.auto_create_deck {
                info!(deck = name, "creating deck");
                return Ok(self.decks.create_deck(name).await?);
            }
            warn!(deck = name, fallback = %config.default_deck, "deck not found, using default");
        }

        match self.decks.find_deck_by_name(&config.default_deck).await? {
            Some(deck) => Ok(deck),
            None => Ok(self.decks.create_deck(&config.default_deck).await?),
        }
    }

    /// Anchor for a block that has none, checked against the document as it is now.
    async fn fresh_anchor(&self, path: &str, uuid: &str) -> Result<String> {
        let text = self.writer.read(path).await?;
        Ok(unique_anchor(uuid, &document_anchors(&text)))
    }

    async fn create_card(&self, path: &str, ann: &Annotation) -> Result<Outcome> {
        let config = self.config();
        let deck = self
            .resolve_deck_for_create(ann.deck_hint.as_deref(), &config)
            .await?;
        let now = self.clock.now();
        let uuid = Uuid::new_v4().to_string();
        let anchor = match ann.block_anchor() {
            Some(anchor) => anchor.to_string(),
            None => self.fresh_anchor(path, &uuid).await?,
        };

        let mut source = self.source_for(ann, &anchor);
        let mut card = Card {
            id: Uuid::new_v4().to_string(),
            uuid: uuid.clone(),
            deck_id: deck.id.clone(),
            content: ann.card_content.clone(),
            content_type: ann.content_type,
            template_id: Some(config.default_template.clone()),
            created: now,
            modified: now,
            annotation_sources: vec![source.clone()],
        };
        self.cards.save_card(&card).await?;

        let metadata = AnnotationMetadata {
            uuid: Some(uuid.clone()),
            created: Some(now),
            modified: Some(now),
            version: Some(1),
            block_anchor: Some(anchor.clone()),
        };
        let hint = BlockHint {
            line: ann.position.start_line,
            anchor: ann.block_anchor(),
            raw_text: Some(&ann.raw_text),
        };
        let check = WriteCheck {
            expected_uuid: Some(uuid.clone()),
            ..Default::default()
        };

        let written = match self
            .writer
            .apply(path, &check, |text| insert_or_update_metadata(text, &hint, &metadata))
            .await
        {
            Ok(written) => written,
            Err(e) => {
                warn!(path, uuid = %uuid, error = %e, "metadata write failed, rolling back card");
                if let Err(rollback) = self.cards.delete_card(&uuid).await {
                    error!(uuid = %uuid, error = %rollback, "rollback failed, card left without source");
                }
                return Err(e);
            }
        };

        if let Some(range) = written.as_deref().and_then(|t| locate_range(t, &anchor)) {
            source.line_range = range;
            card.annotation_sources = vec![source.clone()];
        }
        self.registry.register_annotation(&uuid, source);
        self.registry.update_card_cache(card);

        info!(path, uuid = %uuid, deck = %deck.name, "card created");
        self.emit_change(path, &uuid, AnnotationChange::Created);
        Ok(Outcome::Created)
    }

    async fn deck_change(&self, hint: Option<&str>, card: &Card) -> Result<DeckChange> {
        let Some(name) = hint else {
            return Ok(DeckChange::Keep);
        };
        Ok(match self.decks.find_deck_by_name(name).await? {
            Some(deck) if deck.id != card.deck_id => DeckChange::Move(deck),
            Some(_) => DeckChange::Keep,
            None => DeckChange::Missing(name.to_string()),
        })
    }

    fn warn_missing_deck(&self, name: &str, uuid: &str) {
        warn!(deck = name, uuid, "deck not found, card stays in its deck");
        self.notifier.notify(
            &format!(
                "Deck \"{}\" does not exist; the card stays in its current deck",
                name
            ),
            NotificationLevel::Warning,
        );
    }

    async fn reconcile(&self, path: &str, ann: &Annotation, card: Card) -> Result<Outcome> {
        let deck_change = self.deck_change(ann.deck_hint.as_deref(), &card).await?;
        let content_changed = card.content != ann.card_content;

        if !content_changed && !matches!(deck_change, DeckChange::Move(_)) {
            if let DeckChange::Missing(name) = &deck_change {
                self.warn_missing_deck(name, &card.uuid);
            }
            return self.confirm_unchanged(path, ann, card).await;
        }
        self.update_card(path, ann, card, deck_change).await
    }

    /// Nothing to sync; make sure the block has an anchor and the source is known.
    async fn confirm_unchanged(&self, path: &str, ann: &Annotation, mut card: Card) -> Result<Outcome> {
        let anchor = match ann.block_anchor() {
            Some(anchor) => anchor.to_string(),
            None => {
                let anchor = self.fresh_anchor(path, &card.uuid).await?;
                let metadata = AnnotationMetadata {
                    block_anchor: Some(anchor.clone()),
                    ..Default::default()
                };
                let hint = BlockHint {
                    line: ann.position.start_line,
                    anchor: None,
                    raw_text: Some(&ann.raw_text),
                };
                let check = WriteCheck {
                    expected_uuid: Some(card.uuid.clone()),
                    ..Default::default()
                };
                self.writer
                    .apply(path, &check, |text| insert_or_update_metadata(text, &hint, &metadata))
                    .await?;
                debug!(path, uuid = %card.uuid, anchor = %anchor, "anchor restored");
                anchor
            }
        };

        let source = self.source_for(ann, &anchor);
        if !card.annotation_sources.iter().any(|s| s.same_location(&source)) {
            card.upsert_source(source.clone());
            self.cards.save_card(&card).await?;
            debug!(path, uuid = %card.uuid, "recorded new source");
        }
        self.registry.register_annotation(&card.uuid, source);
        self.registry.update_card_cache(card);
        Ok(Outcome::Unchanged)
    }

    async fn update_card(
        &self,
        path: &str,
        ann: &Annotation,
        mut card: Card,
        deck_change: DeckChange,
    ) -> Result<Outcome> {
        let now = self.clock.now();
        let uuid = card.uuid.clone();
        let anchor = match ann.block_anchor() {
            Some(anchor) => anchor.to_string(),
            None => self.fresh_anchor(path, &uuid).await?,
        };
        let previous_deck = card.deck_id.clone();

        card.content = ann.card_content.clone();
        card.content_type = ann.content_type;
        card.modified = now;
        card.upsert_source(self.source_for(ann, &anchor));

        match &deck_change {
            DeckChange::Move(deck) => {
                card.deck_id = deck.id.clone();
                self.cards.move_card(&card, &previous_deck).await?;
                info!(uuid = %uuid, deck = %deck.name, "card moved");
                self.notifier.notify(
                    &format!("Card moved to deck \"{}\"", deck.name),
                    NotificationLevel::Info,
                );
            }
            DeckChange::Missing(name) => {
                self.cards.save_card(&card).await?;
                self.warn_missing_deck(name, &uuid);
            }
            DeckChange::Keep => self.cards.save_card(&card).await?,
        }

        let version = ann
            .metadata
            .as_ref()
            .and_then(|m| m.version)
            .unwrap_or(1)
            .saturating_add(1);
        let metadata = AnnotationMetadata {
            modified: Some(now),
            version: Some(version),
            block_anchor: Some(anchor.clone()),
            ..Default::default()
        };
        let hint = BlockHint {
            line: ann.position.start_line,
            anchor: ann.block_anchor(),
            raw_text: Some(&ann.raw_text),
        };
        let check = WriteCheck {
            expected_uuid: Some(uuid.clone()),
            ..Default::default()
        };
        let written = self
            .writer
            .apply(path, &check, |text| insert_or_update_metadata(text, &hint, &metadata))
            .await?;

        let mut source = self.source_for(ann, &anchor);
        if let Some(range) = written.as_deref().and_then(|t| locate_range(t, &anchor)) {
            source.line_range = range;
        }
        self.registry.register_annotation(&uuid, source);
        self.registry.update_card_cache(card.clone());
        info!(path, uuid = %uuid, version, "card updated");
        self.emit_change(path, &uuid, AnnotationChange::Updated);

        // A missing deck is not spread to other sources.
        let deck_hint = match deck_change {
            DeckChange::Missing(_) => None,
            _ => ann.deck_hint.as_deref(),
        };
        let fan_out = self.fan_out(&card, Some((path, anchor.as_str())), deck_hint).await;
        self.prune_stale_sources(card, &fan_out.stale).await;
        Ok(Outcome::Updated)
    }

    /// Mirror a card's content into every known source except `origin`.
    ///
    /// Writes to one document run in sequence; documents run concurrently.
    pub async fn fan_out(
        &self,
        card: &Card,
        origin: Option<(&str, &str)>,
        deck_hint: Option<&str>,
    ) -> FanOutReport {
        let mut targets = self.registry.find_annotations_by_uuid(&card.uuid);
        for stored in &card.annotation_sources {
            if !targets.iter().any(|t| t.same_location(stored)) {
                targets.push(stored.clone());
            }
        }

        let mut by_document: BTreeMap<String, Vec<AnnotationSource>> = BTreeMap::new();
        for target in targets {
            let is_origin = origin
                .map_or(false, |(p, a)| target.document_path == p && target.block_anchor == a);
            if !is_origin {
                by_document
                    .entry(target.document_path.clone())
                    .or_default()
                    .push(target);
            }
        }

        let results = join_all(
            by_document
                .into_iter()
                .map(|(path, sources)| self.fan_out_document(card, path, sources, deck_hint)),
        )
        .await;

        let mut report = FanOutReport::default();
        for result in results {
            report.merge(result);
        }
        if report.written > 0 || !report.stale.is_empty() || report.failed > 0 {
            info!(
                uuid = %card.uuid,
                written = report.written,
                stale = report.stale.len(),
                failed = report.failed,
                "fan-out finished"
            );
        }
        report
    }

    async fn fan_out_document(
        &self,
        card: &Card,
        path: String,
        sources: Vec<AnnotationSource>,
        deck_hint: Option<&str>,
    ) -> FanOutReport {
        let mut report = FanOutReport::default();

        if !self.docs.exists(&path).await {
            for source in sources {
                self.registry
                    .unregister_annotation(&card.uuid, &path, &source.block_anchor);
                report.stale.push((path.clone(), source.block_anchor));
            }
            return report;
        }

        for mut source in sources {
            let anchor = source.block_anchor.clone();
            let allowed_shrink = match self.writer.read(&path).await {
                Ok(text) => block_len(&text, &anchor),
                Err(e) => {
                    warn!(path = %path, error = %e, "fan-out read failed");
                    report.failed += 1;
                    continue;
                }
            };
            let check = WriteCheck {
                expected_uuid: Some(card.uuid.clone()),
                allowed_shrink,
                markers_removed: 0,
            };

            let result = self
                .writer
                .apply(&path, &check, |text| {
                    replace_block_body(text, &anchor, &card.content, deck_hint)
                })
                .await;

            match result {
                Ok(written) => {
                    source.last_sync = self.clock.now();
                    match written {
                        Some(text) => {
                            if let Some(range) = locate_range(&text, &anchor) {
                                source.line_range = range;
                            }
                            report.written += 1;
                            self.emit_change(&path, &card.uuid, AnnotationChange::Mirrored);
                        }
                        None => report.unchanged += 1,
                    }
                    self.registry.register_annotation(&card.uuid, source);
                }
                Err(SyncError::Modify(ModifyError::AnchorNotFound { .. })) => {
                    debug!(path = %path, anchor = %anchor, "source anchor gone");
                    self.registry
                        .unregister_annotation(&card.uuid, &path, &anchor);
                    report.stale.push((path.clone(), anchor));
                }
                Err(e) => {
                    warn!(path = %path, uuid = %card.uuid, error = %e, "fan-out write failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Drop vanished sources from the stored card.
    async fn prune_stale_sources(&self, mut card: Card, stale: &[(String, String)]) {
        let mut changed = false;
        for (path, anchor) in stale {
            changed |= card.remove_source(path, anchor);
        }
        if !changed {
            return;
        }
        match self.cards.save_card(&card).await {
            Ok(()) => self.registry.update_card_cache(card),
            Err(e) => warn!(uuid = %card.uuid, error = %e, "failed to prune stale sources"),
        }
    }

    /// Demote a block in place. Returns false if the block was not found.
    async fn demote_block(&self, path: &str, hint: BlockHint<'_>) -> Result<bool> {
        let allowed_shrink = match hint.raw_text {
            Some(raw) => raw.len(),
            None => {
                let text = self.writer.read(path).await?;
                hint.anchor.map(|a| block_len(&text, a)).unwrap_or(0)
            }
        };
        let check = WriteCheck {
            expected_uuid: None,
            allowed_shrink,
            markers_removed: 1,
        };
        match self
            .writer
            .apply(path, &check, |text| cleanup_block(text, &hint))
            .await
        {
            Ok(_) => Ok(true),
            Err(SyncError::Modify(ModifyError::BlockNotFound { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn cleanup_orphan(&self, path: &str, ann: &Annotation, uuid: &str) -> Result<Outcome> {
        let hint = BlockHint {
            line: ann.position.start_line,
            anchor: ann.block_anchor(),
            raw_text: Some(&ann.raw_text),
        };
        let demoted = self.demote_block(path, hint).await?;

        if let Some(anchor) = ann.block_anchor() {
            self.registry.unregister_annotation(uuid, path, anchor);
        }
        self.registry.remove_card_from_cache(uuid);

        if !demoted {
            debug!(path, uuid, "orphaned block already gone");
            return Ok(Outcome::Skipped);
        }

        warn!(path, uuid, "card no longer exists, annotation demoted");
        self.notifier.notify(
            &format!(
                "Card {} no longer exists; its annotation in {} was converted to a note",
                uuid, path
            ),
            NotificationLevel::Warning,
        );
        self.emit_change(path, uuid, AnnotationChange::Orphaned);
        Ok(Outcome::Orphaned)
    }

    /// Card-side edit: mirror the stored card into all of its sources.
    pub async fn push_card_to_documents(&self, uuid: &str) -> Result<FanOutReport> {
        let Some(_syncing) = self.syncing.try_acquire(uuid.to_string()) else {
            debug!(uuid, "card already syncing");
            return Ok(FanOutReport::default());
        };
        let card = self
            .registry
            .load_card(uuid)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("card {}", uuid)))?;

        let report = self.fan_out(&card, None, None).await;
        self.prune_stale_sources(card, &report.stale).await;
        Ok(report)
    }

    /// Card-side deletion: demote every known source. Returns how many were demoted.
    pub async fn handle_card_deleted(&self, uuid: &str) -> Result<usize> {
        let Some(_syncing) = self.syncing.try_acquire(uuid.to_string()) else {
            debug!(uuid, "card already syncing");
            return Ok(0);
        };
        self.registry.remove_card_from_cache(uuid);

        let mut demoted = 0;
        for source in self.registry.find_annotations_by_uuid(uuid) {
            let path = source.document_path.as_str();
            if self.docs.exists(path).await {
                let hint = BlockHint {
                    line: source.line_range.start,
                    anchor: Some(&source.block_anchor),
                    raw_text: None,
                };
                match self.demote_block(path, hint).await {
                    Ok(true) => {
                        demoted += 1;
                        self.emit_change(path, uuid, AnnotationChange::Orphaned);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(path, uuid, error = %e, "failed to demote annotation");
                        continue;
                    }
                }
            }
            self.registry
                .unregister_annotation(uuid, path, &source.block_anchor);
        }

        if demoted > 0 {
            self.notifier.notify(
                &format!(
                    "Card {} was deleted; {} annotation(s) converted to notes",
                    uuid, demoted
                ),
                NotificationLevel::Warning,
            );
        }
        Ok(demoted)
    }
}

#[async_trait]
impl DocumentProcessor for SyncEngine {
    async fn process_document(&self, path: &str, mode: PassMode) -> Result<FileSyncReport> {
        let options = match mode {
            PassMode::Sync => SyncOptions::default(),
            PassMode::DetectOnly => SyncOptions::detect_only(),
        };
        self.sync_document(path, options).await
    }

    fn document_renamed(&self, from: &str, to: &str) -> usize {
        let sources_moved = self.registry.update_document_path(from, to);
        info!(from, to, sources_moved, "document renamed");
        self.emit(EngineEvent::DocumentRenamed {
            from: from.to_string(),
            to: to.to_string(),
            sources_moved,
        });
        sources_moved
    }

    fn document_deleted(&self, path: &str) {
        info!(path, "document deleted");
        self.emit(EngineEvent::DocumentDeleted {
            path: path.to_string(),
        });
    }

    fn batch_completed(&self, report: &BatchReport) {
        self.emit(EngineEvent::BatchCompleted {
            files: report.files.len(),
            failed: report.failed.len(),
        });
    }
}
