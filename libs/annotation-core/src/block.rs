//! Line-level scanner for quoted annotation blocks.
//!
//! # Format
//! ```markdown
//! > [!tuanki] Optional title
//! > Q: What is Rust?
//! > A: A systems programming language.
//! > #deck/rust
//! >
//! > uuid: 0b6c1e0e-2f9b-4c43-9d55-4a1f0f0a4c11
//! > created: 2024-05-01T10:00:00+00:00
//! > ^tk-0b6c1e0e
//! ```
//!
//! A quoted line always continues a block. An unquoted blank line continues
//! it only when the next line is quoted again; any other line ends it.
//! Metadata lines must form the trailing run of the block.

use chrono::DateTime;

use crate::error::DetectionError;

/// Callout type that marks an annotation block.
pub const BLOCK_TYPE: &str = "tuanki";

/// Callout type a block is demoted to when its card is gone.
pub const NOTE_TYPE: &str = "note";

/// How far `block_at` walks upward from a hinted line.
pub const MAX_BACKTRACK: usize = 50;

/// Boundaries of one block inside a line array (zero-based, inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Line holding the open marker.
    pub start: usize,
    /// Last quoted line of the block.
    pub end: usize,
    /// Last line carrying body text; equals `start` when the body is empty.
    pub body_end: usize,
    /// First line of the trailing metadata region, if any.
    pub metadata_start: Option<usize>,
}

impl BlockSpan {
    pub fn has_body(&self) -> bool {
        self.body_end > self.start
    }

    pub fn contains(&self, line: usize) -> bool {
        line >= self.start && line <= self.end
    }
}

/// One recognised metadata line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaLine<'a> {
    Uuid(&'a str),
    Created(&'a str),
    Modified(&'a str),
    Version(&'a str),
    Anchor(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineType {
    Open,
    Malformed,
    Metadata,
    Quoted,
    Blank,
    Text,
}

/// Strip the quote prefix (`>` plus one optional space). `None` if unquoted.
pub fn strip_quote(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('>')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Parse an open marker line. Returns the (possibly empty) title.
pub fn parse_open_marker(line: &str) -> Option<Option<&str>> {
    match marker_kind(line)? {
        Ok(title) => Some(title),
        Err(()) => None,
    }
}

/// `Some(Ok(title))` for a valid marker, `Some(Err(()))` for a broken one,
/// `None` for anything that is not an annotation marker at all.
fn marker_kind(line: &str) -> Option<Result<Option<&str>, ()>> {
    let inner = strip_quote(line)?.trim_start();
    let rest = inner.strip_prefix("[!")?;

    match rest.find(']') {
        Some(close) => {
            if !rest[..close].trim().eq_ignore_ascii_case(BLOCK_TYPE) {
                return None;
            }
            let title = rest[close + 1..]
                .trim_start_matches(|c: char| c == '-' || c == '+')
                .trim();
            Some(Ok(if title.is_empty() { None } else { Some(title) }))
        }
        None => {
            let head = rest.trim_start();
            let looks_like_ours = head.len() >= BLOCK_TYPE.len()
                && head.is_char_boundary(BLOCK_TYPE.len())
                && head[..BLOCK_TYPE.len()].eq_ignore_ascii_case(BLOCK_TYPE);
            if looks_like_ours {
                Some(Err(()))
            } else {
                None
            }
        }
    }
}

pub fn is_open_marker(line: &str) -> bool {
    matches!(marker_kind(line), Some(Ok(_)))
}

/// Check that an anchor token is well formed (`[A-Za-z0-9-]+`).
pub fn is_valid_anchor(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Parse the unquoted text of a line as a metadata entry.
pub fn parse_metadata_line(text: &str) -> Option<MetaLine<'_>> {
    let trimmed = text.trim();

    if let Some(anchor) = trimmed.strip_prefix('^') {
        return is_valid_anchor(anchor).then_some(MetaLine::Anchor(anchor));
    }

    // A key with an unparseable value is ordinary body text.
    let (key, value) = trimmed.split_once(':')?;
    let value = value.trim();
    match key.trim().to_ascii_lowercase().as_str() {
        "uuid" => (!value.is_empty()).then_some(MetaLine::Uuid(value)),
        "created" => is_timestamp(value).then_some(MetaLine::Created(value)),
        "modified" => is_timestamp(value).then_some(MetaLine::Modified(value)),
        "version" => value.parse::<u32>().is_ok().then_some(MetaLine::Version(value)),
        _ => None,
    }
}

fn is_timestamp(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
}

/// Trailing ` ^anchor` token on a body line, if present.
pub fn trailing_anchor(text: &str) -> Option<&str> {
    let trimmed = text.trim_end();
    let idx = trimmed.rfind(" ^")?;
    let token = &trimmed[idx + 2..];
    is_valid_anchor(token).then_some(token)
}

fn classify_line(line: &str) -> LineType {
    match marker_kind(line) {
        Some(Ok(_)) => return LineType::Open,
        Some(Err(())) => return LineType::Malformed,
        None => {}
    }

    if let Some(text) = strip_quote(line) {
        if parse_metadata_line(text).is_some() {
            LineType::Metadata
        } else {
            LineType::Quoted
        }
    } else if line.trim().is_empty() {
        LineType::Blank
    } else {
        LineType::Text
    }
}

fn is_quoted(line: &str) -> bool {
    strip_quote(line).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekingOpen,
    InBlock { start: usize },
    InMetadata { start: usize, metadata_start: usize },
}

struct Scanner<'a, S: AsRef<str>> {
    lines: &'a [S],
    state: State,
    last_quoted: usize,
    last_body: usize,
    spans: Vec<BlockSpan>,
    diagnostics: Vec<DetectionError>,
}

impl<'a, S: AsRef<str>> Scanner<'a, S> {
    fn new(lines: &'a [S]) -> Self {
        Self {
            lines,
            state: State::SeekingOpen,
            last_quoted: 0,
            last_body: 0,
            spans: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn line(&self, idx: usize) -> &'a str {
        let lines: &'a [S] = self.lines;
        lines[idx].as_ref()
    }

    fn open(&mut self, idx: usize) {
        self.state = State::InBlock { start: idx };
        self.last_quoted = idx;
        self.last_body = idx;
    }

    fn close(&mut self) {
        let (start, metadata_start) = match self.state {
            State::SeekingOpen => return,
            State::InBlock { start } => (start, None),
            State::InMetadata {
                start,
                metadata_start,
            } => (start, Some(metadata_start)),
        };
        self.state = State::SeekingOpen;

        if self.last_quoted == start {
            self.diagnostics
                .push(DetectionError::Unterminated { line: start });
            return;
        }

        self.spans.push(BlockSpan {
            start,
            end: self.last_quoted,
            body_end: self.last_body,
            metadata_start,
        });
    }

    fn process_line(&mut self, idx: usize) {
        let kind = classify_line(self.line(idx));

        match self.state {
            State::SeekingOpen => match kind {
                LineType::Open => self.open(idx),
                LineType::Malformed => self.diagnostics.push(DetectionError::MalformedMarker {
                    line: idx,
                    text: self.line(idx).trim().to_string(),
                }),
                _ => {}
            },
            State::InBlock { start } | State::InMetadata { start, .. } => match kind {
                LineType::Open => {
                    self.close();
                    self.open(idx);
                }
                LineType::Metadata => {
                    if let State::InBlock { .. } = self.state {
                        self.state = State::InMetadata {
                            start,
                            metadata_start: idx,
                        };
                    }
                    self.last_quoted = idx;
                }
                LineType::Quoted | LineType::Malformed => {
                    let text = strip_quote(self.line(idx)).unwrap_or_default();
                    if !text.trim().is_empty() {
                        // Body text after metadata: the metadata was not trailing.
                        self.state = State::InBlock { start };
                        self.last_body = idx;
                    }
                    self.last_quoted = idx;
                }
                LineType::Blank => {
                    let continues = idx + 1 < self.lines.len()
                        && is_quoted(self.line(idx + 1))
                        && !is_open_marker(self.line(idx + 1));
                    if !continues {
                        self.close();
                    }
                }
                _ => self.close(),
            },
        }
    }

    fn run(mut self) -> (Vec<BlockSpan>, Vec<DetectionError>) {
        for idx in 0..self.lines.len() {
            self.process_line(idx);
        }
        self.close();
        (self.spans, self.diagnostics)
    }

    /// Scan a single block whose marker sits at `start`.
    fn run_one(mut self, start: usize) -> Option<BlockSpan> {
        self.open(start);
        let mut idx = start + 1;
        while idx < self.lines.len() && self.spans.is_empty() && self.state != State::SeekingOpen {
            self.process_line(idx);
            idx += 1;
        }
        if self.spans.is_empty() {
            self.close();
        }
        self.spans.into_iter().next()
    }
}

/// Scan every block in a line array.
pub fn scan_blocks<S: AsRef<str>>(lines: &[S]) -> (Vec<BlockSpan>, Vec<DetectionError>) {
    Scanner::new(lines).run()
}

/// Scan the single block whose marker is at `start`.
pub fn span_from<S: AsRef<str>>(lines: &[S], start: usize) -> Option<BlockSpan> {
    if start >= lines.len() || !is_open_marker(lines[start].as_ref()) {
        return None;
    }
    Scanner::new(lines).run_one(start)
}

/// Locate the block containing a best-effort hinted line.
///
/// Walks upward from `hint` to the nearest open marker (at most
/// `max_backtrack` lines, never across an unquoted text line) and then
/// downward while lines remain part of the block.
pub fn block_at<S: AsRef<str>>(lines: &[S], hint: usize, max_backtrack: usize) -> Option<BlockSpan> {
    if lines.is_empty() {
        return None;
    }
    let hint = hint.min(lines.len() - 1);
    let floor = hint.saturating_sub(max_backtrack);

    for idx in (floor..=hint).rev() {
        let line = lines[idx].as_ref();
        if is_open_marker(line) {
            return span_from(lines, idx).filter(|span| span.contains(hint) || idx == hint);
        }
        if idx != hint && !is_quoted(line) && !line.trim().is_empty() {
            return None;
        }
    }
    None
}

/// Anchor carried by a block: an `^anchor` metadata line, or a trailing
/// token on the last body line.
pub fn anchor_of<S: AsRef<str>>(lines: &[S], span: &BlockSpan) -> Option<String> {
    if let Some(meta_start) = span.metadata_start {
        for line in &lines[meta_start..=span.end] {
            if let Some(MetaLine::Anchor(anchor)) =
                strip_quote(line.as_ref()).and_then(parse_metadata_line)
            {
                return Some(anchor.to_string());
            }
        }
    }
    if span.has_body() {
        let last = strip_quote(lines[span.body_end].as_ref())?;
        return trailing_anchor(last).map(str::to_string);
    }
    None
}

/// Locate a block by its anchor.
pub fn find_block_by_anchor<S: AsRef<str>>(lines: &[S], anchor: &str) -> Option<BlockSpan> {
    let (spans, _) = scan_blocks(lines);
    spans
        .into_iter()
        .find(|span| anchor_of(lines, span).as_deref() == Some(anchor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(text: &str) -> Vec<&str> {
        text.lines().collect()
    }

    #[test]
    fn scan_single_block() {
        let text = "> [!tuanki]\n> Q: 2+2?\n> A: 4";
        let (spans, diags) = scan_blocks(&lines(text));
        assert!(diags.is_empty());
        assert_eq!(
            spans,
            vec![BlockSpan {
                start: 0,
                end: 2,
                body_end: 2,
                metadata_start: None,
            }]
        );
    }

    #[test]
    fn blank_line_followed_by_quote_continues() {
        let text = "> [!tuanki]\n> Q: one\n\n> A: two\n\nplain text";
        let (spans, _) = scan_blocks(&lines(text));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end, 3);
    }

    #[test]
    fn blank_line_followed_by_text_terminates() {
        let text = "> [!tuanki]\n> Q: one\n\nplain\n> quoted but separate";
        let (spans, _) = scan_blocks(&lines(text));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end, 1);
    }

    #[test]
    fn text_line_terminates() {
        let text = "> [!tuanki]\n> body\nnot quoted";
        let (spans, _) = scan_blocks(&lines(text));
        assert_eq!(spans[0].end, 1);
    }

    #[test]
    fn tracks_trailing_metadata_region() {
        let text = "> [!tuanki]\n> body\n>\n> uuid: abc\n> version: 2\n> ^tk-1";
        let (spans, _) = scan_blocks(&lines(text));
        assert_eq!(spans[0].body_end, 1);
        assert_eq!(spans[0].metadata_start, Some(3));
        assert_eq!(spans[0].end, 5);
    }

    #[test]
    fn metadata_followed_by_body_is_not_trailing() {
        let text = "> [!tuanki]\n> uuid: looks like meta\n> more body";
        let (spans, _) = scan_blocks(&lines(text));
        assert_eq!(spans[0].metadata_start, None);
        assert_eq!(spans[0].body_end, 2);
    }

    #[test]
    fn consecutive_markers_split_blocks() {
        let text = "> [!tuanki]\n> first\n> [!tuanki]\n> second";
        let (spans, _) = scan_blocks(&lines(text));
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].end, 1);
        assert_eq!(spans[1].start, 2);
    }

    #[test]
    fn other_callouts_are_ignored() {
        let text = "> [!note]\n> not ours\n\n> [!TUANKI] Title\n> ours";
        let (spans, _) = scan_blocks(&lines(text));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 3);
    }

    #[test]
    fn malformed_and_unterminated_markers_are_reported() {
        let text = "> [!tuanki\n> body\n\n> [!tuanki]\nplain";
        let (spans, diags) = scan_blocks(&lines(text));
        assert!(spans.is_empty());
        assert_eq!(diags.len(), 2);
        assert!(matches!(diags[0], DetectionError::MalformedMarker { line: 0, .. }));
        assert_eq!(diags[1], DetectionError::Unterminated { line: 3 });
    }

    #[test]
    fn open_marker_title_and_fold_suffix() {
        assert_eq!(parse_open_marker("> [!tuanki] My title"), Some(Some("My title")));
        assert_eq!(parse_open_marker(">[!tuanki]- Folded"), Some(Some("Folded")));
        assert_eq!(parse_open_marker("> [!tuanki]"), Some(None));
        assert_eq!(parse_open_marker("> [!note] x"), None);
        assert_eq!(parse_open_marker("[!tuanki]"), None);
    }

    #[test]
    fn block_at_walks_up_from_hint() {
        let text = "intro\n\n> [!tuanki]\n> one\n> two\n> three\n\nafter";
        let ls = lines(text);
        let span = block_at(&ls, 4, MAX_BACKTRACK).unwrap();
        assert_eq!(span.start, 2);
        assert_eq!(span.end, 5);
        assert!(block_at(&ls, 7, MAX_BACKTRACK).is_none());
    }

    #[test]
    fn block_at_respects_backtrack_bound() {
        let text = "> [!tuanki]\n> a\n> b\n> c\n> d";
        let ls = lines(text);
        assert!(block_at(&ls, 4, 2).is_none());
        assert_eq!(block_at(&ls, 4, 4).unwrap().start, 0);
    }

    #[test]
    fn find_by_anchor_line_or_trailing_token() {
        let text = "> [!tuanki]\n> first\n>\n> uuid: a\n> ^tk-a\n\n> [!tuanki]\n> second ^tk-b";
        let ls = lines(text);
        assert_eq!(find_block_by_anchor(&ls, "tk-a").unwrap().start, 0);
        assert_eq!(find_block_by_anchor(&ls, "tk-b").unwrap().start, 6);
        assert!(find_block_by_anchor(&ls, "tk-c").is_none());
    }

    #[test]
    fn metadata_line_parsing() {
        assert_eq!(parse_metadata_line("uuid: abc"), Some(MetaLine::Uuid("abc")));
        assert_eq!(parse_metadata_line("Version: 3"), Some(MetaLine::Version("3")));
        assert_eq!(parse_metadata_line("^tk-12"), Some(MetaLine::Anchor("tk-12")));
        assert_eq!(parse_metadata_line("^bad anchor"), None);
        assert_eq!(parse_metadata_line("Q: question"), None);
        assert_eq!(parse_metadata_line("Version: 2 of the API"), None);
        assert_eq!(parse_metadata_line("created: yesterday"), None);
        assert_eq!(parse_metadata_line("uuid:"), None);
        assert_eq!(
            parse_metadata_line("modified: 2024-05-02T08:00:00Z"),
            Some(MetaLine::Modified("2024-05-02T08:00:00Z"))
        );
    }
}
