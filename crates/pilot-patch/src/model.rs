//! Immutable value types describing a parsed unified diff
//!
//! A patch is an ordered list of [`FilePatch`]es. Each file patch carries the
//! operation to perform and the ordered [`Hunk`]s describing the change.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

/// Operation a file patch performs on its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    /// Create a file that must not exist yet
    Create,
    /// Edit an existing file in place
    Modify,
    /// Remove an existing file
    Delete,
}

impl Display for FileOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Kind of a single hunk body line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    /// Unchanged line (` ` prefix), must match the target
    Context,
    /// Inserted line (`+` prefix)
    Add,
    /// Deleted line (`-` prefix), must match the target
    Remove,
}

impl LineKind {
    /// Whether the line is part of the old side of the hunk
    #[inline]
    #[must_use]
    pub fn in_old(self) -> bool {
        matches!(self, Self::Context | Self::Remove)
    }

    /// Whether the line is part of the new side of the hunk
    #[inline]
    #[must_use]
    pub fn in_new(self) -> bool {
        matches!(self, Self::Context | Self::Add)
    }

    /// Diff prefix character for this kind
    #[inline]
    #[must_use]
    pub fn prefix(self) -> char {
        match self {
            Self::Context => ' ',
            Self::Add => '+',
            Self::Remove => '-',
        }
    }
}

/// One line of a hunk body, prefix stripped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    kind: LineKind,
    content: String,
}

impl DiffLine {
    /// Create a new diff line
    #[inline]
    #[must_use]
    pub fn new(kind: LineKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    /// Context line
    #[inline]
    #[must_use]
    pub fn context(content: impl Into<String>) -> Self {
        Self::new(LineKind::Context, content)
    }

    /// Added line
    #[inline]
    #[must_use]
    pub fn add(content: impl Into<String>) -> Self {
        Self::new(LineKind::Add, content)
    }

    /// Removed line
    #[inline]
    #[must_use]
    pub fn remove(content: impl Into<String>) -> Self {
        Self::new(LineKind::Remove, content)
    }

    /// Line kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> LineKind {
        self.kind
    }

    /// Line content without the diff prefix
    #[inline]
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

impl Display for DiffLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.content)
    }
}

/// Declared line range of one side of a hunk (`start,count`)
///
/// `start` is 1-based as written in the hunk header. A zero `count` means the
/// side is empty and `start` names the line *after which* the change sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    /// First line, 1-based (0 allowed for empty sides at file start)
    pub start: usize,
    /// Number of lines covered
    pub count: usize,
}

impl LineRange {
    /// Create a new range
    #[inline]
    #[must_use]
    pub const fn new(start: usize, count: usize) -> Self {
        Self { start, count }
    }

    /// 0-based index of the first line this range touches
    ///
    /// For empty ranges this is the insertion point.
    #[inline]
    #[must_use]
    pub const fn first_index(&self) -> usize {
        if self.count == 0 {
            self.start
        } else {
            self.start.saturating_sub(1)
        }
    }

    /// 0-based exclusive end index
    #[inline]
    #[must_use]
    pub const fn end_index(&self) -> usize {
        self.first_index() + self.count
    }
}

impl Display for LineRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.start, self.count)
    }
}

/// Side of a hunk, used in count diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkSide {
    /// Pre-image (`-` range)
    Old,
    /// Post-image (`+` range)
    New,
}

impl Display for HunkSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Old => "old",
            Self::New => "new",
        })
    }
}

/// Hunk whose body disagrees with its declared ranges
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{side} side declares {declared} lines but body has {actual}")]
pub struct HunkCountError {
    /// Side that disagrees
    pub side: HunkSide,
    /// Count from the header
    pub declared: usize,
    /// Count found in the body
    pub actual: usize,
}

/// A contiguous region of change in one file
///
/// # Invariants
/// - context + remove lines == `old.count`
/// - context + add lines == `new.count`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hunk {
    old: LineRange,
    new: LineRange,
    lines: Vec<DiffLine>,
}

impl Hunk {
    /// Create a hunk, checking the body against the declared ranges
    ///
    /// # Errors
    /// Returns [`HunkCountError`] if either side's line count disagrees
    pub fn new(old: LineRange, new: LineRange, lines: Vec<DiffLine>) -> Result<Self, HunkCountError> {
        let old_actual = lines.iter().filter(|l| l.kind.in_old()).count();
        if old_actual != old.count {
            return Err(HunkCountError {
                side: HunkSide::Old,
                declared: old.count,
                actual: old_actual,
            });
        }
        let new_actual = lines.iter().filter(|l| l.kind.in_new()).count();
        if new_actual != new.count {
            return Err(HunkCountError {
                side: HunkSide::New,
                declared: new.count,
                actual: new_actual,
            });
        }
        Ok(Self { old, new, lines })
    }

    /// Old-side range
    #[inline]
    #[must_use]
    pub fn old_range(&self) -> LineRange {
        self.old
    }

    /// New-side range
    #[inline]
    #[must_use]
    pub fn new_range(&self) -> LineRange {
        self.new
    }

    /// Body lines in document order
    #[inline]
    #[must_use]
    pub fn lines(&self) -> &[DiffLine] {
        &self.lines
    }

    /// Added lines in document order
    pub fn added(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.kind == LineKind::Add)
            .map(DiffLine::content)
    }

    /// Pure insertion (empty old side)
    #[inline]
    #[must_use]
    pub fn is_insertion(&self) -> bool {
        self.old.count == 0
    }

    /// Pure deletion (empty new side)
    #[inline]
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.new.count == 0
    }
}

impl Display for Hunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "@@ -{} +{} @@", self.old, self.new)?;
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// All changes targeting one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilePatch {
    path: PathBuf,
    operation: FileOperation,
    hunks: Vec<Hunk>,
}

impl FilePatch {
    /// Create a file patch
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, operation: FileOperation, hunks: Vec<Hunk>) -> Self {
        Self {
            path: path.into(),
            operation,
            hunks,
        }
    }

    /// Target path, relative to the workspace root
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Operation
    #[inline]
    #[must_use]
    pub fn operation(&self) -> FileOperation {
        self.operation
    }

    /// Hunks in document order
    #[inline]
    #[must_use]
    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    /// Content a Create produces: every added line, newline-joined
    #[must_use]
    pub fn created_content(&self) -> String {
        self.hunks
            .iter()
            .flat_map(Hunk::added)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Total added and removed line counts across all hunks
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .fold((0, 0), |(add, rem), line| match line.kind {
                LineKind::Add => (add + 1, rem),
                LineKind::Remove => (add, rem + 1),
                LineKind::Context => (add, rem),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hunk_new_accepts_matching_counts() {
        let hunk = Hunk::new(
            LineRange::new(3, 2),
            LineRange::new(3, 3),
            vec![
                DiffLine::context("a"),
                DiffLine::remove("b"),
                DiffLine::add("c"),
                DiffLine::add("d"),
            ],
        )
        .unwrap();

        assert_eq!(hunk.lines().len(), 4);
        assert_eq!(hunk.added().collect::<Vec<_>>(), vec!["c", "d"]);
    }

    #[test]
    fn hunk_new_rejects_old_count_mismatch() {
        let err = Hunk::new(
            LineRange::new(1, 3),
            LineRange::new(1, 1),
            vec![DiffLine::context("a")],
        )
        .unwrap_err();

        assert_eq!(err.side, HunkSide::Old);
        assert_eq!(err.declared, 3);
        assert_eq!(err.actual, 1);
    }

    #[test]
    fn hunk_new_rejects_new_count_mismatch() {
        let err = Hunk::new(
            LineRange::new(1, 1),
            LineRange::new(1, 2),
            vec![DiffLine::context("a")],
        )
        .unwrap_err();
        assert_eq!(err.side, HunkSide::New);
    }

    #[test]
    fn pure_insertion_and_deletion_are_representable() {
        let insert = Hunk::new(LineRange::new(4, 0), LineRange::new(5, 1), vec![DiffLine::add("x")])
            .unwrap();
        assert!(insert.is_insertion());
        assert_eq!(insert.old_range().first_index(), 4);

        let delete =
            Hunk::new(LineRange::new(2, 1), LineRange::new(1, 0), vec![DiffLine::remove("y")])
                .unwrap();
        assert!(delete.is_deletion());
        assert_eq!(delete.old_range().first_index(), 1);
    }

    #[test]
    fn created_content_joins_added_lines_across_hunks() {
        let h1 = Hunk::new(LineRange::new(0, 0), LineRange::new(1, 2), vec![
            DiffLine::add("one"),
            DiffLine::add("two"),
        ])
        .unwrap();
        let h2 = Hunk::new(LineRange::new(0, 0), LineRange::new(3, 1), vec![DiffLine::add("three")])
            .unwrap();
        let patch = FilePatch::new("new.txt", FileOperation::Create, vec![h1, h2]);

        assert_eq!(patch.created_content(), "one\ntwo\nthree");
        assert_eq!(patch.stats(), (3, 0));
    }

    #[test]
    fn hunk_display_renders_header_and_body() {
        let hunk = Hunk::new(
            LineRange::new(1, 1),
            LineRange::new(1, 1),
            vec![DiffLine::remove("old"), DiffLine::add("new")],
        );
        // old side: 1 remove, new side: 1 add
        let rendered = hunk.unwrap().to_string();
        assert_eq!(rendered, "@@ -1,1 +1,1 @@\n-old\n+new\n");
    }

    #[test]
    fn file_operation_display() {
        assert_eq!(FileOperation::Create.to_string(), "create");
        assert_eq!(FileOperation::Modify.to_string(), "modify");
        assert_eq!(FileOperation::Delete.to_string(), "delete");
    }
}
