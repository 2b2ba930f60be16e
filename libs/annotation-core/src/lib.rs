//! Core annotation library shared by the sync engine and its tools.
//!
//! Provides:
//! - Block scanner for quoted `[!tuanki]` annotation blocks
//! - Detector and extractor turning document text into annotations
//! - Text-level document modifications (metadata, cleanup, fan-out bodies)
//! - Shared types (Annotation, Card, AnnotationSource, etc.)

pub mod block;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod modifier;
pub mod types;

pub use block::{BlockSpan, BLOCK_TYPE, MAX_BACKTRACK};
pub use detector::{annotate, detect, AnnotationScan, DetectedBlock, Detection};
pub use error::{DetectionError, ExtractionError, ModifyError, WriteValidationFailure};
pub use extractor::{classify, extract, ExtractedCard};
pub use modifier::{
    cleanup_block, insert_or_update_metadata, render_metadata, replace_block_body, validate,
    BlockHint, WriteCheck,
};
pub use types::{
    Annotation, AnnotationMetadata, AnnotationPosition, AnnotationSource, Card, ContentType, Deck,
    LineRange,
};
