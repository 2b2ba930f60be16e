//! Error types for annotation-core.

use thiserror::Error;

/// Problems found while scanning a document for annotation blocks.
///
/// These never abort a scan; the offending block is dropped and the
/// diagnostic is handed back to the caller for logging.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    #[error("malformed block marker at line {line}: {text}")]
    MalformedMarker { line: usize, text: String },

    #[error("unterminated block at line {line}: marker without content")]
    Unterminated { line: usize },
}

/// Errors that can occur while extracting card content from a raw block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("empty content")]
    EmptyContent,

    #[error("not an annotation block: missing open marker")]
    MissingMarker,
}

/// Why a modified document was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteValidationFailure {
    #[error("block marker disappeared ({before} before, {after} after)")]
    MarkerLost { before: usize, after: usize },

    #[error("no valid metadata line for uuid {uuid}")]
    MetadataMissing { uuid: String },

    #[error("content shrank from {before} to {after} bytes")]
    ContentShrank { before: usize, after: usize },
}

/// Errors from text-level document modifications.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModifyError {
    #[error("no annotation block near line {line}")]
    BlockNotFound { line: usize },

    #[error("no annotation block with anchor ^{anchor}")]
    AnchorNotFound { anchor: String },

    #[error("write validation failed: {0}")]
    Validation(#[from] WriteValidationFailure),
}
