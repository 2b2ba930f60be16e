//! Block builders and sample cards.

use annotation_core::{AnnotationSource, Card, ContentType, LineRange};
use chrono::{TimeZone, Utc};

/// `Q: 2+2? / A: 4` in deck `math`, with no identity yet.
pub const ARITHMETIC: &str = "> [!tuanki]\n> Q: 2+2?\n> A: 4\n> #deck/math";

/// Quote each line under an open marker.
pub fn block(lines: &[&str]) -> String {
    std::iter::once("> [!tuanki]".to_string())
        .chain(lines.iter().map(|l| if l.is_empty() { ">".to_string() } else { format!("> {}", l) }))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Block already carrying identity metadata.
pub fn processed_block(lines: &[&str], uuid: &str, anchor: &str) -> String {
    format!(
        "{}\n>\n> uuid: {}\n> created: 2024-01-01T00:00:00Z\n> version: 1\n> ^{}",
        block(lines),
        uuid,
        anchor
    )
}

/// Value of the first `uuid:` metadata line in a document.
pub fn uuid_in(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|l| l.strip_prefix("> uuid: "))
        .map(|u| u.trim().to_string())
        .next()
}

/// Value of the first `^anchor` line in a document.
pub fn anchor_in(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|l| l.strip_prefix("> ^"))
        .map(|a| a.trim().to_string())
        .next()
}

pub fn source(path: &str, anchor: &str) -> AnnotationSource {
    AnnotationSource {
        document_path: path.to_string(),
        block_anchor: anchor.to_string(),
        last_sync: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        line_range: LineRange { start: 0, end: 6 },
    }
}

pub fn card(uuid: &str, deck_id: &str, content: &str, sources: Vec<AnnotationSource>) -> Card {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    Card {
        id: format!("card-{}", uuid),
        uuid: uuid.to_string(),
        deck_id: deck_id.to_string(),
        content: content.to_string(),
        content_type: ContentType::QuestionAnswer,
        template_id: Some("basic".to_string()),
        created: at,
        modified: at,
        annotation_sources: sources,
    }
}
