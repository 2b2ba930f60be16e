//! Extraction of card content from raw annotation blocks.

use chrono::{DateTime, Utc};

use crate::block::{parse_metadata_line, parse_open_marker, strip_quote, trailing_anchor, MetaLine};
use crate::error::ExtractionError;
use crate::types::{AnnotationMetadata, ContentType};

const DECK_TAG: &str = "#deck/";

/// Card fields pulled out of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCard {
    pub content: String,
    pub title: Option<String>,
    pub deck_hint: Option<String>,
    pub content_type: ContentType,
    pub metadata: Option<AnnotationMetadata>,
}

/// Parse a raw block (quote markers included) into card content.
pub fn extract(raw: &str) -> Result<ExtractedCard, ExtractionError> {
    let mut lines = raw.lines();
    let marker = lines.next().ok_or(ExtractionError::MissingMarker)?;
    let title = parse_open_marker(marker)
        .ok_or(ExtractionError::MissingMarker)?
        .map(str::to_string);

    // Unquoted blank lines inside a block are empty body lines.
    let mut body: Vec<String> = lines
        .map(|line| strip_quote(line).unwrap_or_default().trim_end().to_string())
        .collect();

    let mut metadata = AnnotationMetadata::default();
    while let Some(last) = body.last() {
        if last.trim().is_empty() {
            body.pop();
            continue;
        }
        match parse_metadata_line(last) {
            Some(entry) => {
                apply_metadata(&mut metadata, entry);
                body.pop();
            }
            None => break,
        }
    }

    if metadata.block_anchor.is_none() {
        if let Some(last) = body.last_mut() {
            if let Some(anchor) = trailing_anchor(last).map(str::to_string) {
                let cut = last.trim_end().len() - anchor.len() - 1;
                last.truncate(cut);
                let trimmed = last.trim_end().len();
                last.truncate(trimmed);
                metadata.block_anchor = Some(anchor);
            }
        }
    }

    let mut deck_hint = None;
    let mut kept = Vec::with_capacity(body.len());
    for line in body {
        match take_deck_tag(&line) {
            Some((name, rest)) => {
                if deck_hint.is_none() {
                    deck_hint = Some(name);
                }
                if !rest.trim().is_empty() {
                    kept.push(rest);
                }
            }
            None => kept.push(line),
        }
    }

    let start = kept.iter().position(|l| !l.trim().is_empty());
    let end = kept.iter().rposition(|l| !l.trim().is_empty());
    let content = match (start, end) {
        (Some(s), Some(e)) => kept[s..=e].join("\n"),
        _ => return Err(ExtractionError::EmptyContent),
    };

    Ok(ExtractedCard {
        content_type: classify(&content),
        content,
        title,
        deck_hint,
        metadata: if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        },
    })
}

fn apply_metadata(metadata: &mut AnnotationMetadata, entry: MetaLine<'_>) {
    // Walking bottom-up: the lowest occurrence of a key wins.
    match entry {
        MetaLine::Uuid(value) if !value.is_empty() && metadata.uuid.is_none() => {
            metadata.uuid = Some(value.to_string());
        }
        MetaLine::Created(value) if metadata.created.is_none() => {
            metadata.created = parse_timestamp(value);
        }
        MetaLine::Modified(value) if metadata.modified.is_none() => {
            metadata.modified = parse_timestamp(value);
        }
        MetaLine::Version(value) if metadata.version.is_none() => {
            metadata.version = value.parse().ok();
        }
        MetaLine::Anchor(value) if metadata.block_anchor.is_none() => {
            metadata.block_anchor = Some(value.to_string());
        }
        _ => {}
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Remove the first `#deck/<name>` token from a line.
/// Returns the deck name and the remaining text.
pub(crate) fn take_deck_tag(line: &str) -> Option<(String, String)> {
    let mut search_from = 0;
    while let Some(offset) = line[search_from..].find(DECK_TAG) {
        let idx = search_from + offset;
        let at_boundary = idx == 0 || line[..idx].ends_with(char::is_whitespace);
        let name_start = idx + DECK_TAG.len();
        let name_end = line[name_start..]
            .find(char::is_whitespace)
            .map(|e| name_start + e)
            .unwrap_or(line.len());
        let name = &line[name_start..name_end];

        if at_boundary && !name.is_empty() {
            let before = line[..idx].trim_end();
            let after = line[name_end..].trim_start();
            let rest = match (before.is_empty(), after.is_empty()) {
                (true, _) => after.to_string(),
                (false, true) => before.to_string(),
                (false, false) => format!("{} {}", before, after),
            };
            return Some((name.to_string(), rest));
        }
        search_from = name_start;
    }
    None
}

/// Classify card content by heuristic signals.
///
/// Only content-type specific consumers care about the result; identity
/// handling never looks at it.
pub fn classify(content: &str) -> ContentType {
    if has_cloze_deletion(content) {
        return ContentType::Cloze;
    }
    if content.lines().any(|l| l.trim_start().starts_with("```")) {
        return ContentType::Code;
    }
    if has_highlight_cloze(content) {
        return ContentType::Cloze;
    }
    if content.lines().filter(|l| is_option_line(l)).count() >= 2 {
        return ContentType::MultipleChoice;
    }
    if is_question_answer(content) {
        return ContentType::QuestionAnswer;
    }
    ContentType::Basic
}

fn has_cloze_deletion(content: &str) -> bool {
    content.match_indices("{{c").any(|(idx, _)| {
        let rest = &content[idx + 3..];
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        digits > 0 && rest[digits..].starts_with("::")
    })
}

fn has_highlight_cloze(content: &str) -> bool {
    content.lines().any(|line| {
        let mut parts = line.split("==");
        parts.next();
        matches!((parts.next(), parts.next()), (Some(inner), Some(_)) if !inner.trim().is_empty())
    })
}

fn is_option_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("- [") {
        return rest.starts_with(" ]") || rest.starts_with("x]") || rest.starts_with("X]");
    }
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(letter), Some('.' | ')'), Some(' ')) => matches!(letter, 'A'..='H' | 'a'..='h'),
        _ => false,
    }
}

fn is_question_answer(content: &str) -> bool {
    let has_prefix = content.lines().any(|l| {
        let t = l.trim_start().to_ascii_lowercase();
        t.starts_with("q:") || t.starts_with("question:")
    });
    if has_prefix {
        return true;
    }
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    match lines.next() {
        Some(first) => first.trim_end().ends_with('?') && lines.next().is_some(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extract_example_block() {
        let card = extract("> [!tuanki]\n> Q: 2+2?\n> A: 4\n> #deck/math").unwrap();
        assert_eq!(card.content, "Q: 2+2?\nA: 4");
        assert_eq!(card.deck_hint.as_deref(), Some("math"));
        assert_eq!(card.title, None);
        assert_eq!(card.metadata, None);
        assert_eq!(card.content_type, ContentType::QuestionAnswer);
    }

    #[test]
    fn extract_metadata_region() {
        let raw = "> [!tuanki] Arithmetic\n> Q: 2+2?\n> A: 4\n>\n> uuid: abc-123\n> created: 2024-05-01T10:00:00Z\n> modified: 2024-05-02T10:00:00+02:00\n> version: 3\n> ^tk-abc";
        let card = extract(raw).unwrap();
        assert_eq!(card.title.as_deref(), Some("Arithmetic"));
        assert_eq!(card.content, "Q: 2+2?\nA: 4");

        let meta = card.metadata.unwrap();
        assert_eq!(meta.uuid.as_deref(), Some("abc-123"));
        assert_eq!(meta.version, Some(3));
        assert_eq!(meta.block_anchor.as_deref(), Some("tk-abc"));
        assert_eq!(
            meta.modified.unwrap().to_rfc3339(),
            "2024-05-02T08:00:00+00:00"
        );
        assert!(meta.created.is_some());
    }

    #[test]
    fn extract_keeps_metadata_lookalikes_in_content() {
        let raw = "> [!tuanki]\n> body\n> created: yesterday\n> Version: 2 of the API";
        let card = extract(raw).unwrap();
        assert_eq!(card.content, "body\ncreated: yesterday\nVersion: 2 of the API");
        assert_eq!(card.metadata, None);
    }

    #[test]
    fn extract_trailing_anchor_on_body_line() {
        let card = extract("> [!tuanki]\n> front\n> back ^tk-9").unwrap();
        assert_eq!(card.content, "front\nback");
        assert_eq!(
            card.metadata.unwrap().block_anchor.as_deref(),
            Some("tk-9")
        );
    }

    #[test]
    fn extract_inline_deck_tag() {
        let card = extract("> [!tuanki]\n> What is ownership? #deck/rust/basics\n> Single owner.").unwrap();
        assert_eq!(card.deck_hint.as_deref(), Some("rust/basics"));
        assert_eq!(card.content, "What is ownership?\nSingle owner.");
    }

    #[test]
    fn extract_keeps_inner_blank_lines() {
        let card = extract("> [!tuanki]\n>\n> one\n>\n> two\n>").unwrap();
        assert_eq!(card.content, "one\n\ntwo");
    }

    #[test]
    fn extract_empty_content_fails() {
        assert_eq!(
            extract("> [!tuanki]\n> #deck/math\n>\n> uuid: x"),
            Err(ExtractionError::EmptyContent)
        );
        assert_eq!(extract("> [!tuanki]"), Err(ExtractionError::EmptyContent));
    }

    #[test]
    fn extract_requires_marker() {
        assert_eq!(extract("> just a quote"), Err(ExtractionError::MissingMarker));
    }

    #[test]
    fn classify_content_types() {
        assert_eq!(classify("The {{c1::borrow checker}} enforces rules"), ContentType::Cloze);
        assert_eq!(classify("Rust's ==ownership== model"), ContentType::Cloze);
        assert_eq!(classify("Pick one\nA. red\nB. blue"), ContentType::MultipleChoice);
        assert_eq!(classify("- [ ] yes\n- [x] no"), ContentType::MultipleChoice);
        assert_eq!(classify("```rust\nlet x = a == b && c == d;\n```"), ContentType::Code);
        assert_eq!(classify("Q: why?\nA: because"), ContentType::QuestionAnswer);
        assert_eq!(classify("What is Rust?\nA language."), ContentType::QuestionAnswer);
        assert_eq!(classify("What is Rust?"), ContentType::Basic);
        assert_eq!(classify("Plain fact."), ContentType::Basic);
    }
}
