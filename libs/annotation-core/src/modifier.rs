//! Text-level modifications of annotation blocks.
//!
//! Every operation takes the whole document text and returns the whole new
//! text. Callers own reading and writing.

use chrono::SecondsFormat;

use crate::block::{
    anchor_of, block_at, find_block_by_anchor, is_open_marker, parse_metadata_line, scan_blocks,
    strip_quote, trailing_anchor, BlockSpan, MetaLine, MAX_BACKTRACK, NOTE_TYPE,
};
use crate::error::{ModifyError, WriteValidationFailure};
use crate::extractor::take_deck_tag;
use crate::types::AnnotationMetadata;

/// Best-effort description of where a block is.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockHint<'a> {
    /// Line the block was last seen at (zero-based).
    pub line: usize,
    /// Anchor, when the block has one.
    pub anchor: Option<&'a str>,
    /// Raw block text as detected; a located block must match it exactly.
    pub raw_text: Option<&'a str>,
}

/// What a post-write validation expects of the new text.
#[derive(Debug, Clone, Default)]
pub struct WriteCheck {
    /// A `uuid:` metadata line with this value must exist.
    pub expected_uuid: Option<String>,
    /// Bytes the document may legitimately lose beyond the default tolerance.
    pub allowed_shrink: usize,
    /// Open markers the write may legitimately remove.
    pub markers_removed: usize,
}

/// Fraction of the original size a write may shrink by without explanation.
const SHRINK_TOLERANCE: f64 = 0.1;

struct Document<'a> {
    lines: Vec<&'a str>,
    newline: &'static str,
    trailing_newline: bool,
}

impl<'a> Document<'a> {
    fn parse(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect(),
            newline: if text.contains("\r\n") { "\r\n" } else { "\n" },
            trailing_newline: text.ends_with('\n'),
        }
    }

    fn render(&self, lines: Vec<String>) -> String {
        let mut out = lines.join(self.newline);
        if self.trailing_newline {
            out.push_str(self.newline);
        }
        out
    }

    fn span_text(&self, span: &BlockSpan) -> String {
        self.lines[span.start..=span.end].join("\n")
    }

    fn locate(&self, hint: &BlockHint<'_>) -> Result<BlockSpan, ModifyError> {
        if let Some(anchor) = hint.anchor {
            if let Some(span) = find_block_by_anchor(&self.lines, anchor) {
                return Ok(span);
            }
        }

        if let Some(span) = block_at(&self.lines, hint.line, MAX_BACKTRACK) {
            if hint.raw_text.map_or(true, |raw| self.span_text(&span) == raw) {
                return Ok(span);
            }
        }

        if let Some(raw) = hint.raw_text {
            let (spans, _) = scan_blocks(&self.lines);
            if let Some(span) = spans.into_iter().find(|s| self.span_text(s) == raw) {
                return Ok(span);
            }
        }

        Err(ModifyError::BlockNotFound { line: hint.line })
    }

    /// Body lines of a block with any trailing anchor token removed.
    fn body_lines(&self, span: &BlockSpan) -> Vec<String> {
        let mut body: Vec<String> = self.lines[span.start + 1..=span.body_end]
            .iter()
            .map(|l| l.to_string())
            .collect();
        if span.metadata_start.is_none() {
            if let Some(last) = body.last_mut() {
                strip_trailing_anchor(last);
            }
        }
        body
    }
}

fn strip_trailing_anchor(line: &mut String) {
    let token_len = strip_quote(line)
        .and_then(trailing_anchor)
        .map(|t| t.len());
    if let Some(len) = token_len {
        let cut = line.trim_end().len() - len - 2;
        line.truncate(cut);
        let trimmed = line.trim_end().len();
        line.truncate(trimmed);
    }
}

fn quote(text: &str) -> String {
    if text.is_empty() {
        ">".to_string()
    } else {
        format!("> {}", text)
    }
}

fn read_metadata(lines: &[&str], span: &BlockSpan) -> AnnotationMetadata {
    let mut meta = AnnotationMetadata {
        block_anchor: anchor_of(lines, span),
        ..Default::default()
    };
    let Some(start) = span.metadata_start else {
        return meta;
    };
    for line in &lines[start..=span.end] {
        match strip_quote(line).and_then(parse_metadata_line) {
            Some(MetaLine::Uuid(v)) if !v.is_empty() => meta.uuid = Some(v.to_string()),
            Some(MetaLine::Created(v)) => {
                meta.created = chrono::DateTime::parse_from_rfc3339(v)
                    .ok()
                    .map(|d| d.with_timezone(&chrono::Utc))
            }
            Some(MetaLine::Modified(v)) => {
                meta.modified = chrono::DateTime::parse_from_rfc3339(v)
                    .ok()
                    .map(|d| d.with_timezone(&chrono::Utc))
            }
            Some(MetaLine::Version(v)) => meta.version = v.parse().ok(),
            _ => {}
        }
    }
    meta
}

/// Render metadata as quoted lines, in wire order.
pub fn render_metadata(meta: &AnnotationMetadata) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(uuid) = &meta.uuid {
        out.push(quote(&format!("uuid: {}", uuid)));
    }
    if let Some(created) = meta.created {
        out.push(quote(&format!(
            "created: {}",
            created.to_rfc3339_opts(SecondsFormat::Secs, true)
        )));
    }
    if let Some(modified) = meta.modified {
        out.push(quote(&format!(
            "modified: {}",
            modified.to_rfc3339_opts(SecondsFormat::Secs, true)
        )));
    }
    if let Some(version) = meta.version {
        out.push(quote(&format!("version: {}", version)));
    }
    if let Some(anchor) = &meta.block_anchor {
        out.push(quote(&format!("^{}", anchor)));
    }
    out
}

/// Insert identity metadata into a block, or replace what is there.
///
/// Fields missing from `metadata` keep their current values. The metadata
/// region always follows the body after a single `>` separator line.
pub fn insert_or_update_metadata(
    text: &str,
    hint: &BlockHint<'_>,
    metadata: &AnnotationMetadata,
) -> Result<String, ModifyError> {
    let doc = Document::parse(text);
    let span = doc.locate(hint)?;
    let existing = read_metadata(&doc.lines, &span);

    let merged = AnnotationMetadata {
        uuid: metadata.uuid.clone().or(existing.uuid),
        created: metadata.created.or(existing.created),
        modified: metadata.modified.or(existing.modified),
        version: metadata.version.or(existing.version),
        block_anchor: metadata.block_anchor.clone().or(existing.block_anchor),
    };

    let mut out: Vec<String> = doc.lines[..=span.start].iter().map(|l| l.to_string()).collect();
    out.extend(doc.body_lines(&span));
    out.push(">".to_string());
    out.extend(render_metadata(&merged));
    out.extend(doc.lines[span.end + 1..].iter().map(|l| l.to_string()));

    Ok(doc.render(out))
}

/// Demote a block's marker to a plain note and strip its identity metadata.
pub fn cleanup_block(text: &str, hint: &BlockHint<'_>) -> Result<String, ModifyError> {
    let doc = Document::parse(text);
    let span = doc.locate(hint)?;

    let mut out: Vec<String> = doc.lines[..span.start].iter().map(|l| l.to_string()).collect();
    out.push(demote_marker(doc.lines[span.start]));
    out.extend(doc.body_lines(&span));
    out.extend(doc.lines[span.end + 1..].iter().map(|l| l.to_string()));

    Ok(doc.render(out))
}

fn demote_marker(line: &str) -> String {
    match (line.find("[!"), line.find(']')) {
        (Some(open), Some(close)) if close > open => {
            format!("{}[!{}{}", &line[..open], NOTE_TYPE, &line[close..])
        }
        _ => line.to_string(),
    }
}

/// Replace a block's body, keeping its marker line and metadata region.
///
/// With `deck_hint` set, a `#deck/<name>` line is written after the content;
/// otherwise the first deck tag already in the body, inline or standalone,
/// is kept on a line of its own.
pub fn replace_block_body(
    text: &str,
    anchor: &str,
    content: &str,
    deck_hint: Option<&str>,
) -> Result<String, ModifyError> {
    let doc = Document::parse(text);
    let span = find_block_by_anchor(&doc.lines, anchor).ok_or_else(|| ModifyError::AnchorNotFound {
        anchor: anchor.to_string(),
    })?;

    let existing_deck = doc.lines[span.start + 1..=span.body_end]
        .iter()
        .filter_map(|l| strip_quote(l))
        .find_map(take_deck_tag)
        .map(|(name, _)| name);

    let mut out: Vec<String> = doc.lines[..=span.start].iter().map(|l| l.to_string()).collect();
    out.extend(content.lines().map(quote));
    match deck_hint {
        Some(deck) => out.push(quote(&format!("#deck/{}", deck))),
        None => out.extend(existing_deck.map(|deck| quote(&format!("#deck/{}", deck)))),
    }

    match span.metadata_start {
        Some(_) => {
            out.push(">".to_string());
            let region_start = (span.body_end + 1..=span.end)
                .find(|&i| {
                    strip_quote(doc.lines[i]).map_or(false, |t| !t.trim().is_empty())
                })
                .unwrap_or(span.end);
            out.extend(doc.lines[region_start..=span.end].iter().map(|l| l.to_string()));
        }
        None => {
            out.push(">".to_string());
            out.push(quote(&format!("^{}", anchor)));
        }
    }
    out.extend(doc.lines[span.end + 1..].iter().map(|l| l.to_string()));

    Ok(doc.render(out))
}

fn count_markers(text: &str) -> usize {
    text.lines().filter(|l| is_open_marker(l)).count()
}

fn has_uuid_line(text: &str, uuid: &str) -> bool {
    text.lines()
        .filter_map(strip_quote)
        .any(|t| parse_metadata_line(t) == Some(MetaLine::Uuid(uuid)))
}

/// Check a modified document before it is persisted.
pub fn validate(before: &str, after: &str, check: &WriteCheck) -> Result<(), WriteValidationFailure> {
    let markers_before = count_markers(before);
    let markers_after = count_markers(after);
    if markers_after + check.markers_removed < markers_before {
        return Err(WriteValidationFailure::MarkerLost {
            before: markers_before,
            after: markers_after,
        });
    }

    if let Some(uuid) = &check.expected_uuid {
        if !has_uuid_line(after, uuid) {
            return Err(WriteValidationFailure::MetadataMissing { uuid: uuid.clone() });
        }
    }

    let tolerance = ((before.len() as f64 * SHRINK_TOLERANCE) as usize).max(check.allowed_shrink);
    if after.len() + tolerance < before.len() {
        return Err(WriteValidationFailure::ContentShrank {
            before: before.len(),
            after: after.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn meta(uuid: &str, anchor: &str) -> AnnotationMetadata {
        AnnotationMetadata {
            uuid: Some(uuid.to_string()),
            created: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
            modified: None,
            version: Some(1),
            block_anchor: Some(anchor.to_string()),
        }
    }

    #[test]
    fn insert_metadata_appends_after_separator() {
        let text = "intro\n\n> [!tuanki]\n> Q: 2+2?\n> A: 4\n> #deck/math\n\nafter\n";
        let hint = BlockHint {
            line: 2,
            ..Default::default()
        };
        let out = insert_or_update_metadata(text, &hint, &meta("u-1", "tk-1")).unwrap();
        assert_eq!(
            out,
            "intro\n\n> [!tuanki]\n> Q: 2+2?\n> A: 4\n> #deck/math\n>\n> uuid: u-1\n> created: 2024-05-01T10:00:00Z\n> version: 1\n> ^tk-1\n\nafter\n"
        );
    }

    #[test]
    fn update_metadata_replaces_region_and_keeps_unset_fields() {
        let text = "> [!tuanki]\n> body\n>\n> uuid: u-1\n> created: 2024-05-01T10:00:00Z\n> version: 1\n> ^tk-1";
        let hint = BlockHint {
            line: 0,
            anchor: Some("tk-1"),
            raw_text: None,
        };
        let update = AnnotationMetadata {
            modified: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            version: Some(2),
            ..Default::default()
        };
        let out = insert_or_update_metadata(text, &hint, &update).unwrap();
        assert_eq!(
            out,
            "> [!tuanki]\n> body\n>\n> uuid: u-1\n> created: 2024-05-01T10:00:00Z\n> modified: 2024-06-01T00:00:00Z\n> version: 2\n> ^tk-1"
        );
    }

    #[test]
    fn insert_metadata_moves_trailing_anchor() {
        let text = "> [!tuanki]\n> body ^tk-7";
        let hint = BlockHint::default();
        let out = insert_or_update_metadata(text, &hint, &AnnotationMetadata {
            uuid: Some("u".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(out, "> [!tuanki]\n> body\n>\n> uuid: u\n> ^tk-7");
    }

    #[test]
    fn locate_uses_raw_text_when_hint_is_stale() {
        let text = "> [!tuanki]\n> first\n\n> [!tuanki]\n> second";
        let hint = BlockHint {
            line: 0,
            anchor: None,
            raw_text: Some("> [!tuanki]\n> second"),
        };
        let out = insert_or_update_metadata(text, &hint, &meta("u-2", "tk-2")).unwrap();
        assert!(out.starts_with("> [!tuanki]\n> first\n\n> [!tuanki]\n> second\n>\n> uuid: u-2"));
    }

    #[test]
    fn missing_block_is_an_error() {
        let hint = BlockHint {
            line: 0,
            ..Default::default()
        };
        assert_eq!(
            insert_or_update_metadata("just text", &hint, &meta("u", "a")),
            Err(ModifyError::BlockNotFound { line: 0 })
        );
    }

    #[test]
    fn cleanup_demotes_marker_and_strips_metadata() {
        let text = "> [!tuanki] Title\n> body\n> #deck/x\n>\n> uuid: u-1\n> version: 1\n> ^tk-1\n\nafter";
        let hint = BlockHint {
            line: 0,
            anchor: Some("tk-1"),
            raw_text: None,
        };
        let out = cleanup_block(text, &hint).unwrap();
        assert_eq!(out, "> [!note] Title\n> body\n> #deck/x\n\nafter");
    }

    #[test]
    fn replace_body_keeps_metadata_region() {
        let text = "> [!tuanki] T\n> old body\n> #deck/math\n>\n> uuid: u-1\n> ^tk-b\nafter";
        let out = replace_block_body(text, "tk-b", "new\n\nbody", None).unwrap();
        assert_eq!(
            out,
            "> [!tuanki] T\n> new\n>\n> body\n> #deck/math\n>\n> uuid: u-1\n> ^tk-b\nafter"
        );
    }

    #[test]
    fn replace_body_keeps_inline_deck_tag() {
        let text = "> [!tuanki]\n> Question? #deck/x\n> Answer #deck/ignored later\n>\n> uuid: u-1\n> ^tk-d";
        let out = replace_block_body(text, "tk-d", "Edited?\nYes", None).unwrap();
        assert_eq!(
            out,
            "> [!tuanki]\n> Edited?\n> Yes\n> #deck/x\n>\n> uuid: u-1\n> ^tk-d"
        );
    }

    #[test]
    fn replace_body_with_new_deck_and_trailing_anchor() {
        let text = "> [!tuanki]\n> old ^tk-c";
        let out = replace_block_body(text, "tk-c", "fresh", Some("rust")).unwrap();
        assert_eq!(out, "> [!tuanki]\n> fresh\n> #deck/rust\n>\n> ^tk-c");
    }

    #[test]
    fn replace_body_unknown_anchor() {
        assert_eq!(
            replace_block_body("> [!tuanki]\n> x", "nope", "y", None),
            Err(ModifyError::AnchorNotFound {
                anchor: "nope".to_string()
            })
        );
    }

    #[test]
    fn preserves_crlf_line_endings() {
        let text = "> [!tuanki]\r\n> body\r\n";
        let out = insert_or_update_metadata(text, &BlockHint::default(), &meta("u", "a")).unwrap();
        assert!(out.contains("> body\r\n>\r\n> uuid: u\r\n"));
        assert!(out.ends_with("> ^a\r\n"));
    }

    #[test]
    fn validate_accepts_metadata_insert() {
        let before = "> [!tuanki]\n> body";
        let after = "> [!tuanki]\n> body\n>\n> uuid: u\n> ^a";
        let check = WriteCheck {
            expected_uuid: Some("u".to_string()),
            ..Default::default()
        };
        assert_eq!(validate(before, after, &check), Ok(()));
    }

    #[test]
    fn validate_rejects_lost_marker() {
        let check = WriteCheck::default();
        assert!(matches!(
            validate("> [!tuanki]\n> body", "> body", &check),
            Err(WriteValidationFailure::MarkerLost { before: 1, after: 0 })
        ));
        let cleanup = WriteCheck {
            markers_removed: 1,
            allowed_shrink: 8,
            ..Default::default()
        };
        assert_eq!(validate("> [!tuanki]\n> body", "> [!note]\n> body", &cleanup), Ok(()));
    }

    #[test]
    fn validate_rejects_missing_uuid() {
        let check = WriteCheck {
            expected_uuid: Some("u".to_string()),
            ..Default::default()
        };
        assert_eq!(
            validate("> [!tuanki]\n> body", "> [!tuanki]\n> body\n> uuid: other", &check),
            Err(WriteValidationFailure::MetadataMissing {
                uuid: "u".to_string()
            })
        );
    }

    #[test]
    fn validate_rejects_implausible_shrink() {
        let before = format!("> [!tuanki]\n> {}", "x".repeat(200));
        let after = "> [!tuanki]\n> x";
        assert!(matches!(
            validate(&before, after, &WriteCheck::default()),
            Err(WriteValidationFailure::ContentShrank { .. })
        ));
        let allowed = WriteCheck {
            allowed_shrink: 300,
            ..Default::default()
        };
        assert_eq!(validate(&before, after, &allowed), Ok(()));
    }
}
