//! Events broadcast by the sync engine.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationChange {
    Created,
    Updated,
    /// Block demoted because its card is gone.
    Orphaned,
    /// Block body rewritten from another source of the same card.
    Mirrored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    AnnotationChanged {
        path: String,
        uuid: String,
        change: AnnotationChange,
    },
    DocumentDeleted {
        path: String,
    },
    DocumentRenamed {
        from: String,
        to: String,
        sources_moved: usize,
    },
    BatchCompleted {
        files: usize,
        failed: usize,
    },
}
