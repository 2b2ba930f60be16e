//! Runtime configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "ANNOTATION_SYNC_";

/// Settings for detection, syncing and the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run a sync pass after a debounced modification.
    pub auto_sync: bool,
    /// Keep the file watcher running.
    pub auto_detect: bool,
    pub debounce_ms: u64,
    /// Batch size for multi-file operations.
    pub concurrency: usize,
    /// Create a deck named by a block's deck tag when it does not exist yet.
    pub auto_create_deck: bool,
    pub default_deck: String,
    pub default_template: String,
    /// Only react to modifications of the active document.
    pub active_document_only: bool,
    /// Sync (rather than only detect) during the startup scan.
    pub initial_scan_auto_sync: bool,
    pub extensions: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            auto_detect: true,
            debounce_ms: 1000,
            concurrency: 3,
            auto_create_deck: true,
            default_deck: "Default".to_string(),
            default_template: "basic".to_string(),
            active_document_only: false,
            initial_scan_auto_sync: false,
            extensions: vec!["md".to_string()],
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `ANNOTATION_SYNC_*` environment variables.
    ///
    /// Loads a `.env` file first when present. Unparsable values are ignored.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    fn from_vars<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let flag = |key: &str| get(key).and_then(|v| parse_bool(&v));

        if let Some(v) = flag("AUTO_SYNC") {
            config.auto_sync = v;
        }
        if let Some(v) = flag("AUTO_DETECT") {
            config.auto_detect = v;
        }
        if let Some(v) = get("DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            config.debounce_ms = v;
        }
        if let Some(v) = get("CONCURRENCY").and_then(|v| v.parse().ok()) {
            config.concurrency = v;
        }
        if let Some(v) = flag("AUTO_CREATE_DECK") {
            config.auto_create_deck = v;
        }
        if let Some(v) = get("DEFAULT_DECK").filter(|v| !v.trim().is_empty()) {
            config.default_deck = v;
        }
        if let Some(v) = get("DEFAULT_TEMPLATE").filter(|v| !v.trim().is_empty()) {
            config.default_template = v;
        }
        if let Some(v) = flag("ACTIVE_DOCUMENT_ONLY") {
            config.active_document_only = v;
        }
        if let Some(v) = flag("INITIAL_SCAN_AUTO_SYNC") {
            config.initial_scan_auto_sync = v;
        }
        if let Some(v) = get("EXTENSIONS") {
            let exts: Vec<String> = v
                .split(',')
                .map(|e| e.trim().trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty())
                .collect();
            if !exts.is_empty() {
                config.extensions = exts;
            }
        }
        config.normalized()
    }

    /// Clamp values that would stall the engine.
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self
    }

    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(v) = patch.auto_sync {
            self.auto_sync = v;
        }
        if let Some(v) = patch.auto_detect {
            self.auto_detect = v;
        }
        if let Some(v) = patch.debounce_ms {
            self.debounce_ms = v;
        }
        if let Some(v) = patch.concurrency {
            self.concurrency = v.max(1);
        }
        if let Some(v) = patch.auto_create_deck {
            self.auto_create_deck = v;
        }
        if let Some(v) = &patch.default_deck {
            self.default_deck = v.clone();
        }
        if let Some(v) = &patch.default_template {
            self.default_template = v.clone();
        }
        if let Some(v) = patch.active_document_only {
            self.active_document_only = v;
        }
        if let Some(v) = patch.initial_scan_auto_sync {
            self.initial_scan_auto_sync = v;
        }
        if let Some(v) = &patch.extensions {
            self.extensions = v.clone();
        }
    }

    /// Whether a document path has a watched extension.
    pub fn matches_extension(&self, path: &str) -> bool {
        std::path::Path::new(path)
            .extension()
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|e| ext.eq_ignore_ascii_case(e.as_str()))
            })
            .unwrap_or(false)
    }
}

/// Partial configuration update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub auto_sync: Option<bool>,
    pub auto_detect: Option<bool>,
    pub debounce_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub auto_create_deck: Option<bool>,
    pub default_deck: Option<String>,
    pub default_template: Option<String>,
    pub active_document_only: Option<bool>,
    pub initial_scan_auto_sync: Option<bool>,
    pub extensions: Option<Vec<String>>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Default location of the card database.
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("annotation-sync")
        .join("cards.db")
}
