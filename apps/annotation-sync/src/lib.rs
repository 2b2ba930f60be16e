pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod debounce;
pub mod error;
pub mod events;
pub mod logging;
pub mod notification;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod sync;
pub mod watcher;

use std::sync::Arc;

use clap::Parser;

pub use config::{ConfigPatch, SyncConfig};
pub use error::{Result, StoreError, SyncError};
pub use events::{AnnotationChange, EngineEvent};
pub use orchestrator::{Orchestrator, SystemState};
pub use sync::{BatchReport, FanOutReport, FileSyncReport, SyncOptions};

use crate::cli::Args;
use crate::db::SqliteStore;
use crate::store::FsDocumentStore;

pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = SyncConfig::from_env();
    logging::init();

    let dir = args.resolve_dir()?;
    let db_path = args.db.clone().unwrap_or_else(config::default_db_path);

    tracing::info!(db = %db_path.display(), "Opening card database...");
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let documents = Arc::new(FsDocumentStore::new(dir.clone(), config.extensions.clone()));

    let config = SyncConfig {
        auto_detect: config.auto_detect && !args.once,
        ..config
    };
    let mut orchestrator = Orchestrator::new(config)
        .with_document_store(documents)
        .with_card_store(store.clone())
        .with_deck_service(store);

    orchestrator.initialize().await?;

    if args.once {
        let batch = orchestrator.sync_all().await?;
        println!("{}", serde_json::to_string_pretty(&batch)?);
        orchestrator.destroy();
        return Ok(());
    }

    tracing::info!(dir = %dir.display(), "Watching for changes, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    orchestrator.destroy();
    Ok(())
}
