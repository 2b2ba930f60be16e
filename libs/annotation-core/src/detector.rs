//! Detection of annotation blocks in document text.

use chrono::{DateTime, Utc};

use crate::block::{anchor_of, scan_blocks, BlockSpan};
use crate::error::{DetectionError, ExtractionError};
use crate::extractor::{extract, ExtractedCard};
use crate::types::{Annotation, AnnotationPosition};

/// A block found by the detector, before extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedBlock {
    pub position: AnnotationPosition,
    pub raw_text: String,
    pub span: BlockSpan,
}

/// Result of scanning one document.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub blocks: Vec<DetectedBlock>,
    pub diagnostics: Vec<DetectionError>,
}

/// Detection plus extraction for one document.
#[derive(Debug, Clone, Default)]
pub struct AnnotationScan {
    pub annotations: Vec<Annotation>,
    pub rejected: Vec<(DetectedBlock, ExtractionError)>,
    pub diagnostics: Vec<DetectionError>,
}

/// Scan document text for annotation blocks. Pure and idempotent.
pub fn detect(text: &str, path: &str) -> Detection {
    let lines: Vec<&str> = text.lines().collect();
    let (spans, diagnostics) = scan_blocks(&lines);

    let blocks = spans
        .into_iter()
        .map(|span| DetectedBlock {
            position: AnnotationPosition {
                document_path: path.to_string(),
                start_line: span.start,
                end_line: span.end,
                block_anchor: anchor_of(&lines, &span),
            },
            raw_text: lines[span.start..=span.end].join("\n"),
            span,
        })
        .collect();

    Detection {
        blocks,
        diagnostics,
    }
}

/// Detect and extract every annotation in a document.
///
/// Blocks whose extraction fails are returned in `rejected` and never become
/// annotations.
pub fn annotate(text: &str, path: &str, detected_at: DateTime<Utc>) -> AnnotationScan {
    let detection = detect(text, path);
    let mut scan = AnnotationScan {
        diagnostics: detection.diagnostics,
        ..Default::default()
    };

    for block in detection.blocks {
        match extract(&block.raw_text) {
            Ok(extracted) => scan
                .annotations
                .push(Annotation::new(block, extracted, detected_at)),
            Err(e) => scan.rejected.push((block, e)),
        }
    }

    scan
}

impl Annotation {
    /// Join a detected block with its extracted content.
    pub fn new(block: DetectedBlock, extracted: ExtractedCard, detected_at: DateTime<Utc>) -> Self {
        let mut position = block.position;
        let mut metadata = extracted.metadata;

        // The scanner and the extractor agree on anchors; prefer whichever found one.
        match (&position.block_anchor, metadata.as_mut()) {
            (Some(anchor), Some(meta)) if meta.block_anchor.is_none() => {
                meta.block_anchor = Some(anchor.clone());
            }
            (None, Some(meta)) => position.block_anchor = meta.block_anchor.clone(),
            _ => {}
        }

        Self {
            id: format!("{}#L{}", position.document_path, position.start_line + 1),
            position,
            raw_text: block.raw_text,
            card_content: extracted.content,
            title: extracted.title,
            deck_hint: extracted.deck_hint,
            content_type: extracted.content_type,
            metadata,
            detected_at,
        }
    }
}
