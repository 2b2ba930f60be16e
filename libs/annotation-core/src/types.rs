//! Core types for annotation synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of card content, inferred from heuristic signals in the block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    QuestionAnswer,
    Cloze,
    MultipleChoice,
    Code,
    Basic,
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Basic
    }
}

impl ContentType {
    /// Get the content type name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuestionAnswer => "question_answer",
            Self::Cloze => "cloze",
            Self::MultipleChoice => "multiple_choice",
            Self::Code => "code",
            Self::Basic => "basic",
        }
    }

    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "question_answer" => Some(Self::QuestionAnswer),
            "cloze" => Some(Self::Cloze),
            "multiple_choice" => Some(Self::MultipleChoice),
            "code" => Some(Self::Code),
            "basic" => Some(Self::Basic),
            _ => None,
        }
    }
}

/// Inclusive zero-based line range inside a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

/// Where an annotation block was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationPosition {
    pub document_path: String,
    /// Zero-based line of the open marker.
    pub start_line: usize,
    /// Zero-based line of the last quoted line (inclusive).
    pub end_line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_anchor: Option<String>,
}

impl AnnotationPosition {
    pub fn line_range(&self) -> LineRange {
        LineRange {
            start: self.start_line,
            end: self.end_line,
        }
    }
}

/// Identity metadata already present inside a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_anchor: Option<String>,
}

impl AnnotationMetadata {
    pub fn is_empty(&self) -> bool {
        self.uuid.is_none()
            && self.created.is_none()
            && self.modified.is_none()
            && self.version.is_none()
            && self.block_anchor.is_none()
    }
}

/// One detected block occurrence. Created fresh on every scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    /// Ephemeral detection identifier, not a persisted identity.
    pub id: String,
    pub position: AnnotationPosition,
    pub raw_text: String,
    pub card_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deck_hint: Option<String>,
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnnotationMetadata>,
    pub detected_at: DateTime<Utc>,
}

impl Annotation {
    /// The stable identity carried by the block, if any.
    pub fn uuid(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.uuid.as_deref())
    }

    pub fn block_anchor(&self) -> Option<&str> {
        self.position.block_anchor.as_deref()
    }

    /// An annotation is processed once it carries a uuid.
    pub fn is_processed(&self) -> bool {
        self.uuid().is_some()
    }
}

/// A document location referencing a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationSource {
    pub document_path: String,
    pub block_anchor: String,
    pub last_sync: DateTime<Utc>,
    pub line_range: LineRange,
}

impl AnnotationSource {
    /// Sources are identified by document path and anchor.
    pub fn same_location(&self, other: &AnnotationSource) -> bool {
        self.document_path == other.document_path && self.block_anchor == other.block_anchor
    }
}

/// Card record as seen through the card store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub uuid: String,
    pub deck_id: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub annotation_sources: Vec<AnnotationSource>,
}

impl Card {
    /// Insert or replace a source, deduplicated by (document_path, block_anchor).
    pub fn upsert_source(&mut self, source: AnnotationSource) {
        match self
            .annotation_sources
            .iter_mut()
            .find(|s| s.same_location(&source))
        {
            Some(existing) => *existing = source,
            None => self.annotation_sources.push(source),
        }
    }

    /// Drop a source by location. Returns true if one was removed.
    pub fn remove_source(&mut self, document_path: &str, block_anchor: &str) -> bool {
        let before = self.annotation_sources.len();
        self.annotation_sources
            .retain(|s| !(s.document_path == document_path && s.block_anchor == block_anchor));
        before != self.annotation_sources.len()
    }
}

/// Deck a card belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deck {
    pub id: String,
    pub name: String,
}
