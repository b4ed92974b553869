//! Line-oriented unified-diff parser
//!
//! Recognizes, per file block:
//! - an optional `diff --git a/.. b/..` line plus git extended headers
//! - `new file mode` / `deleted file mode` markers
//! - the `--- old` / `+++ new` path pair (`/dev/null` implies create/delete)
//! - one or more `@@ -a,b +c,d @@` hunks with ` `, `+`, `-` body lines
//!
//! Hunk bodies are consumed by their declared counts, so a removed line that
//! happens to read `-- foo` is never mistaken for a file header. Prose before
//! the first file header is ignored, and so is prose after a file block whose
//! hunks are complete: such a line closes the block, and any `@@` that follows
//! without a new header is rejected. A stray `+`, `-` or space-prefixed line
//! after a hunk is still an error. The parser never touches the filesystem.

use crate::model::{DiffLine, FileOperation, FilePatch, Hunk, HunkCountError, LineKind, LineRange};

const DEV_NULL: &str = "/dev/null";

/// Git extended header prefixes carrying nothing the engine needs
const IGNORED_HEADERS: &[&str] = &[
    "index ",
    "similarity index",
    "dissimilarity index",
    "rename from",
    "rename to",
    "copy from",
    "copy to",
    "old mode",
    "new mode",
];

/// Errors produced while parsing diff text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Line that fits nowhere in the grammar
    #[error("unexpected line {line}: {content:?}")]
    UnexpectedLine { line: usize, content: String },

    /// Malformed `@@` range marker
    #[error("invalid hunk header at line {line}: {content:?}")]
    InvalidHunkHeader { line: usize, content: String },

    /// `---` header not followed by `+++`
    #[error("missing '+++' header after line {line}")]
    MissingNewPath { line: usize },

    /// Hunk found before any file header
    #[error("hunk at line {line} has no file header")]
    HunkWithoutFile { line: usize },

    /// Input ended inside a hunk body
    #[error("hunk starting at line {line} ends early: expected {expected_old} old / {expected_new} new lines")]
    HunkBodyTooShort {
        line: usize,
        expected_old: usize,
        expected_new: usize,
    },

    /// Hunk body holds more lines than its header declares
    #[error("hunk starting at line {line}: {source}")]
    HunkCountMismatch {
        line: usize,
        #[source]
        source: HunkCountError,
    },

    /// File block marked both created and deleted
    #[error("file block at line {line} is marked both created and deleted")]
    ConflictingMarkers { line: usize },

    /// Modify block with nothing to apply
    #[error("modify of '{path}' (line {line}) has no hunks")]
    ModifyWithoutHunks { path: String, line: usize },

    /// File block without any usable path
    #[error("file block at line {line} names no path")]
    MissingPath { line: usize },

    /// No file blocks at all
    #[error("patch contains no file changes")]
    EmptyPatch,
}

/// Unified-diff parser
///
/// Stateless; a single instance can parse any number of patches.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchParser;

impl PatchParser {
    /// Create new parser
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parse diff text into ordered file patches
    ///
    /// # Errors
    /// Returns [`ParseError`] naming the first malformed line
    pub fn parse(&self, text: &str) -> Result<Vec<FilePatch>, ParseError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut files = Vec::new();
        let mut pending: Option<PendingFile> = None;
        let mut idx = 0;

        while idx < lines.len() {
            let line = lines[idx];
            let line_no = idx + 1;

            if let Some(rest) = line.strip_prefix("diff --git ") {
                if let Some(done) = pending.take() {
                    files.push(done.finish()?);
                }
                pending = Some(PendingFile::from_git_header(line_no, rest));
                idx += 1;
                continue;
            }

            if let Some(rest) = line.strip_prefix("--- ") {
                let starts_new = pending.as_ref().map_or(true, PendingFile::has_path_pair_or_hunks);
                if starts_new {
                    if let Some(done) = pending.take() {
                        files.push(done.finish()?);
                    }
                    pending = Some(PendingFile::new(line_no));
                }
                if let Some(file) = pending.as_mut() {
                    file.old_path = Some(header_path(rest));
                }
                // The `+++` line must follow immediately.
                match lines.get(idx + 1).and_then(|l| l.strip_prefix("+++ ")) {
                    Some(new) => {
                        if let Some(file) = pending.as_mut() {
                            file.new_path = Some(header_path(new));
                        }
                        idx += 2;
                        continue;
                    }
                    None => return Err(ParseError::MissingNewPath { line: line_no }),
                }
            }

            if line.starts_with("@@") {
                let file = pending
                    .as_mut()
                    .ok_or(ParseError::HunkWithoutFile { line: line_no })?;
                let (hunk, consumed) = parse_hunk(&lines, idx)?;
                file.hunks.push(hunk);
                idx += consumed;
                continue;
            }

            let mut close_block = false;
            match pending.as_mut() {
                None => {
                    // Prose outside any file block.
                }
                Some(file) => {
                    if line.starts_with("new file mode") {
                        file.created = true;
                    } else if line.starts_with("deleted file mode") {
                        file.deleted = true;
                    } else if line.trim().is_empty()
                        || line.starts_with('\\')
                        || line.starts_with("Binary files")
                        || IGNORED_HEADERS.iter().any(|h| line.starts_with(h))
                    {
                        // Metadata with no effect on the applied content.
                    } else if !file.hunks.is_empty() && !is_body_line(line) {
                        close_block = true;
                    } else {
                        return Err(ParseError::UnexpectedLine {
                            line: line_no,
                            content: line.to_string(),
                        });
                    }
                }
            }
            if close_block {
                if let Some(done) = pending.take() {
                    files.push(done.finish()?);
                }
            }
            idx += 1;
        }

        if let Some(done) = pending.take() {
            files.push(done.finish()?);
        }

        if files.is_empty() {
            return Err(ParseError::EmptyPatch);
        }
        Ok(files)
    }
}

/// Whether `line` has the shape of a hunk body line
fn is_body_line(line: &str) -> bool {
    line.starts_with([' ', '+', '-'])
}

/// Parse diff text with a default parser
///
/// # Errors
/// See [`PatchParser::parse`]
pub fn parse_patch(text: &str) -> Result<Vec<FilePatch>, ParseError> {
    PatchParser::new().parse(text)
}

/// File block under construction
#[derive(Debug)]
struct PendingFile {
    line: usize,
    git_path: Option<String>,
    old_path: Option<String>,
    new_path: Option<String>,
    created: bool,
    deleted: bool,
    hunks: Vec<Hunk>,
}

impl PendingFile {
    fn new(line: usize) -> Self {
        Self {
            line,
            git_path: None,
            old_path: None,
            new_path: None,
            created: false,
            deleted: false,
            hunks: Vec::new(),
        }
    }

    fn from_git_header(line: usize, rest: &str) -> Self {
        let mut file = Self::new(line);
        // `a/<old> b/<new>`; the new side wins.
        file.git_path = rest
            .rfind(" b/")
            .map(|pos| rest[pos + 1..].to_string())
            .map(|p| strip_side_prefix(&p).to_string());
        file
    }

    fn has_path_pair_or_hunks(&self) -> bool {
        self.old_path.is_some() || !self.hunks.is_empty()
    }

    fn finish(self) -> Result<FilePatch, ParseError> {
        let old_null = self.old_path.as_deref() == Some(DEV_NULL);
        let new_null = self.new_path.as_deref() == Some(DEV_NULL);

        let created = self.created || old_null;
        let deleted = self.deleted || new_null;
        if created && deleted {
            return Err(ParseError::ConflictingMarkers { line: self.line });
        }

        let path = [self.new_path, self.old_path, self.git_path]
            .into_iter()
            .flatten()
            .find(|p| p != DEV_NULL)
            .ok_or(ParseError::MissingPath { line: self.line })?;

        let operation = if created {
            FileOperation::Create
        } else if deleted {
            FileOperation::Delete
        } else {
            FileOperation::Modify
        };

        if operation == FileOperation::Modify && self.hunks.is_empty() {
            return Err(ParseError::ModifyWithoutHunks {
                path,
                line: self.line,
            });
        }

        Ok(FilePatch::new(path, operation, self.hunks))
    }
}

/// Path from a `---`/`+++` header, minus timestamp and `a/`/`b/` prefix
fn header_path(raw: &str) -> String {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    let raw = raw.trim_matches('"');
    if raw == DEV_NULL {
        return raw.to_string();
    }
    strip_side_prefix(raw).to_string()
}

fn strip_side_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Parse one hunk starting at `start`; returns the hunk and lines consumed
fn parse_hunk(lines: &[&str], start: usize) -> Result<(Hunk, usize), ParseError> {
    let header = lines[start];
    let line_no = start + 1;
    let (old, new) = parse_hunk_header(header).ok_or_else(|| ParseError::InvalidHunkHeader {
        line: line_no,
        content: header.to_string(),
    })?;

    let mut body = Vec::with_capacity(old.count.max(new.count));
    let mut old_seen = 0;
    let mut new_seen = 0;
    let mut idx = start + 1;

    while old_seen < old.count || new_seen < new.count {
        let Some(&raw) = lines.get(idx) else {
            return Err(ParseError::HunkBodyTooShort {
                line: line_no,
                expected_old: old.count,
                expected_new: new.count,
            });
        };
        idx += 1;

        let (kind, content) = match raw.chars().next() {
            Some('+') => (LineKind::Add, &raw[1..]),
            Some('-') => (LineKind::Remove, &raw[1..]),
            Some(' ') => (LineKind::Context, &raw[1..]),
            // Editors and models often strip the lone space of blank context.
            None => (LineKind::Context, ""),
            Some('\\') => continue,
            Some(_) => {
                return Err(ParseError::UnexpectedLine {
                    line: idx,
                    content: raw.to_string(),
                })
            }
        };

        if kind.in_old() {
            old_seen += 1;
        }
        if kind.in_new() {
            new_seen += 1;
        }
        if old_seen > old.count || new_seen > new.count {
            return Err(ParseError::UnexpectedLine {
                line: idx,
                content: raw.to_string(),
            });
        }
        body.push(DiffLine::new(kind, content));
    }

    // Trailing "\ No newline at end of file" markers belong to this hunk.
    while lines.get(idx).is_some_and(|l| l.starts_with('\\')) {
        idx += 1;
    }

    let hunk = Hunk::new(old, new, body)
        .map_err(|source| ParseError::HunkCountMismatch { line: line_no, source })?;
    Ok((hunk, idx - start))
}

/// Parse `@@ -a[,b] +c[,d] @@ [section]`
fn parse_hunk_header(header: &str) -> Option<(LineRange, LineRange)> {
    let rest = header.strip_prefix("@@ ")?;
    let end = rest.find(" @@")?;
    let mut ranges = rest[..end].split_whitespace();
    let old = parse_range(ranges.next()?.strip_prefix('-')?)?;
    let new = parse_range(ranges.next()?.strip_prefix('+')?)?;
    if ranges.next().is_some() {
        return None;
    }
    Some((old, new))
}

fn parse_range(text: &str) -> Option<LineRange> {
    match text.split_once(',') {
        Some((start, count)) => Some(LineRange::new(start.parse().ok()?, count.parse().ok()?)),
        None => Some(LineRange::new(text.parse().ok()?, 1)),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn body_line() -> impl Strategy<Value = (LineKind, String)> {
        (
            prop_oneof![Just(LineKind::Context), Just(LineKind::Add), Just(LineKind::Remove)],
            "[a-z ]{0,12}",
        )
    }

    proptest! {
        #[test]
        fn parsed_hunks_satisfy_count_invariant(body in prop::collection::vec(body_line(), 1..20)) {
            let old_count = body.iter().filter(|(k, _)| k.in_old()).count();
            let new_count = body.iter().filter(|(k, _)| k.in_new()).count();
            let mut text = format!("--- a/f\n+++ b/f\n@@ -1,{old_count} +1,{new_count} @@\n");
            for (kind, content) in &body {
                text.push(kind.prefix());
                text.push_str(content);
                text.push('\n');
            }

            let files = parse_patch(&text).unwrap();
            let hunk = &files[0].hunks()[0];
            prop_assert_eq!(hunk.lines().len(), body.len());
            for (line, (kind, content)) in hunk.lines().iter().zip(&body) {
                prop_assert_eq!(line.kind(), *kind);
                prop_assert_eq!(line.content(), content.as_str());
            }
        }
    }
}
