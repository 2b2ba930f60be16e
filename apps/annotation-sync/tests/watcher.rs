//! Watcher-driven passes: debounce, creation, rename and deletion.

mod common;

use std::time::Duration;

use annotation_sync::store::DocumentEvent;
use annotation_sync::{EngineEvent, SyncConfig};
use pretty_assertions::assert_eq;

use common::fixtures::{self, ARITHMETIC};
use common::TestContext;

fn modified(path: &str) -> DocumentEvent {
    DocumentEvent::Modified(path.to_string())
}

#[tokio::test]
async fn test_debounced_edit_runs_one_sync() {
    let ctx = TestContext::new().await;
    let watcher = ctx.orchestrator.watcher().unwrap();
    ctx.docs.insert("a.md", ARITHMETIC);

    for _ in 0..3 {
        watcher.handle_event(modified("a.md")).await;
        ctx.advance_ms(400);
    }
    assert_eq!(watcher.flush_due().await, 0);
    assert!(ctx.cards.cards().is_empty());

    ctx.advance_ms(1000);
    assert_eq!(watcher.flush_due().await, 1);
    assert_eq!(ctx.cards.cards().len(), 1);
    assert_eq!(ctx.orchestrator.get_system_state().stats.operations, 1);
}

#[tokio::test]
async fn test_created_document_is_only_detected() {
    let ctx = TestContext::new().await;
    let watcher = ctx.orchestrator.watcher().unwrap();
    ctx.docs.insert("new.md", ARITHMETIC);

    watcher
        .handle_event(DocumentEvent::Created("new.md".to_string()))
        .await;
    ctx.advance_ms(2000);
    assert_eq!(watcher.flush_due().await, 1);

    assert!(ctx.cards.cards().is_empty());
    assert_eq!(ctx.doc("new.md"), ARITHMETIC);
}

#[tokio::test]
async fn test_edit_right_after_create_stays_detect_only() {
    let ctx = TestContext::new().await;
    let watcher = ctx.orchestrator.watcher().unwrap();
    ctx.docs.insert("new.md", ARITHMETIC);

    watcher
        .handle_event(DocumentEvent::Created("new.md".to_string()))
        .await;
    ctx.advance_ms(100);
    watcher.handle_event(modified("new.md")).await;
    ctx.advance_ms(2000);
    assert_eq!(watcher.flush_due().await, 1);

    assert!(ctx.cards.cards().is_empty());
    assert_eq!(ctx.doc("new.md"), ARITHMETIC);

    watcher.handle_event(modified("new.md")).await;
    ctx.advance_ms(2000);
    assert_eq!(watcher.flush_due().await, 1);
    assert_eq!(ctx.cards.cards().len(), 1);
}

#[tokio::test]
async fn test_rename_keeps_identity() {
    let ctx = TestContext::new().await;
    let watcher = ctx.orchestrator.watcher().unwrap();
    let mut events = ctx.orchestrator.subscribe().unwrap();
    ctx.docs.insert("old.md", ARITHMETIC);
    ctx.sync("old.md").await;
    let uuid = ctx.only_card().uuid;
    while events.try_recv().is_ok() {}

    ctx.docs.rename("old.md", "new.md");
    watcher
        .handle_event(DocumentEvent::Renamed {
            from: "old.md".to_string(),
            to: "new.md".to_string(),
        })
        .await;

    let registry = ctx.orchestrator.registry().unwrap();
    assert_eq!(registry.uuids_in_document("new.md"), vec![uuid.clone()]);
    assert!(registry.uuids_in_document("old.md").is_empty());
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::DocumentRenamed {
            from: "old.md".to_string(),
            to: "new.md".to_string(),
            sources_moved: 1,
        }
    );

    let report = ctx.sync("new.md").await;
    assert_eq!(report.unchanged, 1);
    let card = ctx.only_card();
    assert_eq!(card.uuid, uuid);
    assert!(card
        .annotation_sources
        .iter()
        .any(|s| s.document_path == "new.md"));
    assert_eq!(fixtures::uuid_in(&ctx.doc("new.md")), Some(uuid));
}

#[tokio::test]
async fn test_delete_leaves_cards_alone() {
    let ctx = TestContext::new().await;
    let watcher = ctx.orchestrator.watcher().unwrap();
    ctx.docs.insert("a.md", ARITHMETIC);
    ctx.sync("a.md").await;
    let mut events = ctx.orchestrator.subscribe().unwrap();
    let mutations = ctx.cards.mutation_count();

    watcher.handle_event(modified("a.md")).await;
    ctx.docs.remove("a.md");
    watcher
        .handle_event(DocumentEvent::Deleted("a.md".to_string()))
        .await;

    assert!(!watcher.is_pending("a.md"));
    assert_eq!(ctx.cards.mutation_count(), mutations);
    assert_eq!(ctx.cards.cards().len(), 1);
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::DocumentDeleted {
            path: "a.md".to_string()
        }
    );
}

#[tokio::test]
async fn test_running_watcher_picks_up_edits() {
    let ctx = TestContext::with_config(SyncConfig {
        debounce_ms: 100,
        ..Default::default()
    })
    .await;
    let watcher = ctx.orchestrator.watcher().unwrap();

    ctx.docs.insert("a.md", "# empty");
    ctx.docs.edit("a.md", ARITHMETIC);

    let mut waited = 0;
    while !watcher.is_pending("a.md") && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(watcher.is_pending("a.md"));

    ctx.advance_ms(500);
    let mut waited = 0;
    while ctx.cards.cards().is_empty() && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(ctx.cards.cards().len(), 1);
    assert!(fixtures::uuid_in(&ctx.doc("a.md")).is_some());
}
