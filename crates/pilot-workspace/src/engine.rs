//! Transactional patch engine
//!
//! Applies parsed [`FilePatch`]es to a [`WorkspaceStore`] all-or-nothing:
//! a failing file rolls back every change made in the same cycle, leaving the
//! workspace byte-identical to its state before [`PatchEngine::apply`].
//!
//! Hunks within a file are applied in descending order of their old-side
//! start, so earlier hunks keep the line numbers they were written against.

use crate::error::{PatchEngineError, PatchError, WorkspaceError};
use crate::store::WorkspaceStore;
use crate::undo::{AppliedChange, ChangeKind, RollbackReport, UndoLog};
use pilot_patch::{FileOperation, FilePatch, Hunk, LineKind, PatchParser};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Outcome for one file in an apply call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResult {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Requested operation
    pub operation: FileOperation,
    /// Whether this file's change was written
    pub success: bool,
    /// Failure message, when `success` is false
    pub error: Option<String>,
    /// Whether a later failure undid this file's change
    pub rolled_back: bool,
}

/// Outcome of one apply call
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchApplicationResult {
    /// All files applied and kept
    pub success: bool,
    /// Per-file outcomes, in patch order, up to the first failure
    pub files: Vec<FileResult>,
    /// First failure, if any
    pub error: Option<String>,
    /// Rollback summary when a failure triggered one
    pub rollback: Option<RollbackReport>,
}

impl PatchApplicationResult {
    /// Paths whose changes are currently on disk
    #[must_use]
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|f| f.success && !f.rolled_back)
            .map(|f| f.path.clone())
            .collect()
    }
}

enum FileFailure {
    Patch(PatchError),
    Io { path: PathBuf, source: std::io::Error },
}

impl From<PatchError> for FileFailure {
    fn from(err: PatchError) -> Self {
        Self::Patch(err)
    }
}

fn io_failure(path: &Path) -> impl FnOnce(std::io::Error) -> FileFailure + '_ {
    move |source| FileFailure::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Applies patches to one workspace with an undo log
#[derive(Debug)]
pub struct PatchEngine<'a> {
    store: &'a WorkspaceStore,
    parser: PatchParser,
    log: UndoLog,
}

impl<'a> PatchEngine<'a> {
    /// Create engine bound to a workspace
    #[must_use]
    pub fn new(store: &'a WorkspaceStore) -> Self {
        Self {
            store,
            parser: PatchParser::new(),
            log: UndoLog::new(),
        }
    }

    /// Changes the next [`rollback`](Self::rollback) would undo
    #[inline]
    #[must_use]
    pub fn pending(&self) -> &[AppliedChange] {
        self.log.entries()
    }

    /// Parse `diff` and apply it
    ///
    /// A parse failure touches nothing and is returned as
    /// [`PatchEngineError::Parse`].
    pub async fn apply_diff(&mut self, diff: &str) -> Result<PatchApplicationResult, PatchEngineError> {
        let patches = self.parser.parse(diff)?;
        self.apply(&patches).await
    }

    /// Apply `patches` in order as one unit
    ///
    /// Starts a new cycle: changes from a previous apply are committed first.
    /// An expected per-file failure rolls back and yields `success: false`;
    /// an unexpected IO failure rolls back and is returned as an error.
    pub async fn apply(
        &mut self,
        patches: &[FilePatch],
    ) -> Result<PatchApplicationResult, PatchEngineError> {
        self.commit();
        let mut result = PatchApplicationResult::default();

        for patch in patches {
            tracing::debug!(path = %patch.path().display(), op = %patch.operation(), "applying file patch");
            match self.apply_file(patch).await {
                Ok(()) => result.files.push(FileResult {
                    path: patch.path().to_path_buf(),
                    operation: patch.operation(),
                    success: true,
                    error: None,
                    rolled_back: false,
                }),
                Err(FileFailure::Patch(err)) => {
                    tracing::warn!(path = %patch.path().display(), error = %err, "file patch failed; rolling back");
                    let report = self.rollback().await;
                    for file in &mut result.files {
                        file.rolled_back = true;
                    }
                    result.files.push(FileResult {
                        path: patch.path().to_path_buf(),
                        operation: patch.operation(),
                        success: false,
                        error: Some(err.to_string()),
                        rolled_back: false,
                    });
                    result.error = Some(err.to_string());
                    result.rollback = Some(report);
                    return Ok(result);
                }
                Err(FileFailure::Io { path, source }) => {
                    tracing::warn!(path = %path.display(), error = %source, "io failure; rolling back");
                    self.rollback().await;
                    return Err(PatchEngineError::Io { path, source });
                }
            }
        }

        result.success = true;
        tracing::info!(files = result.files.len(), "patch applied");
        Ok(result)
    }

    /// Undo every change of the current cycle, newest first
    pub async fn rollback(&mut self) -> RollbackReport {
        let report = self.log.rollback().await;
        tracing::info!(
            restored = report.restored,
            failed = report.failures.len(),
            "rollback finished"
        );
        report
    }

    /// Keep the current changes; clears the undo log
    pub fn commit(&mut self) -> usize {
        self.log.clear()
    }

    async fn apply_file(&mut self, patch: &FilePatch) -> Result<(), FileFailure> {
        let target = self.store.resolve(patch.path()).map_err(|e| match e {
            WorkspaceError::PathEscapes { path, reason } => PatchError::InvalidPath {
                path,
                reason: reason.to_string(),
            },
            other => PatchError::InvalidPath {
                path: patch.path().to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        match patch.operation() {
            FileOperation::Create => self.create(patch, &target).await,
            FileOperation::Modify => self.modify(patch, &target).await,
            FileOperation::Delete => self.delete(patch, &target).await,
        }
    }

    async fn create(&mut self, patch: &FilePatch, target: &Path) -> Result<(), FileFailure> {
        let exists = tokio::fs::try_exists(target)
            .await
            .map_err(io_failure(target))?;
        if exists {
            return Err(PatchError::AlreadyExists(patch.path().to_path_buf()).into());
        }

        let mut created_dirs = Vec::new();
        let mut dir = target.parent();
        while let Some(d) = dir {
            if d == self.store.root()
                || tokio::fs::try_exists(d).await.map_err(io_failure(d))?
            {
                break;
            }
            created_dirs.push(d.to_path_buf());
            dir = d.parent();
        }

        self.log.record(AppliedChange::new(
            target,
            ChangeKind::Created {
                created_dirs: created_dirs.clone(),
            },
        ));
        if let Some(parent) = created_dirs.first() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_failure(parent))?;
        }
        tokio::fs::write(target, patch.created_content())
            .await
            .map_err(io_failure(target))
    }

    async fn modify(&mut self, patch: &FilePatch, target: &Path) -> Result<(), FileFailure> {
        let original = read_existing(patch, target).await?;
        let text = std::str::from_utf8(&original)
            .map_err(|_| PatchError::NotUtf8(patch.path().to_path_buf()))?;
        let updated = apply_hunks(patch.path(), text, patch.hunks())?;

        self.log
            .record(AppliedChange::new(target, ChangeKind::Modified { original }));
        tokio::fs::write(target, updated)
            .await
            .map_err(io_failure(target))
    }

    async fn delete(&mut self, patch: &FilePatch, target: &Path) -> Result<(), FileFailure> {
        let original = read_existing(patch, target).await?;
        self.log
            .record(AppliedChange::new(target, ChangeKind::Deleted { original }));
        tokio::fs::remove_file(target)
            .await
            .map_err(io_failure(target))
    }
}

async fn read_existing(patch: &FilePatch, target: &Path) -> Result<Vec<u8>, FileFailure> {
    match tokio::fs::read(target).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(PatchError::NotFound(patch.path().to_path_buf()).into())
        }
        Err(e) => Err(FileFailure::Io {
            path: target.to_path_buf(),
            source: e,
        }),
    }
}

/// Apply `hunks` to `text` in memory
///
/// The trailing-newline state of `text` is preserved, as are CRLF line
/// endings on untouched lines.
pub fn apply_hunks(path: &Path, text: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let trailing_newline = text.ends_with('\n');
    let body = text.strip_suffix('\n').unwrap_or(text);
    let mut lines: Vec<String> = if text.is_empty() {
        Vec::new()
    } else {
        body.split('\n').map(String::from).collect()
    };
    let crlf = lines.first().is_some_and(|l| l.ends_with('\r'));

    let mut order: Vec<&Hunk> = hunks.iter().collect();
    order.sort_by_key(|h| (h.old_range().first_index(), h.old_range().count));
    for pair in order.windows(2) {
        let (a, b) = (pair[0].old_range(), pair[1].old_range());
        if a.count > 0 && b.first_index() < a.end_index() {
            return Err(PatchError::OverlappingHunks {
                path: path.to_path_buf(),
                first: a,
                second: b,
            });
        }
    }

    for hunk in order.into_iter().rev() {
        apply_hunk(path, &mut lines, hunk, crlf)?;
    }

    let mut out = lines.join("\n");
    if trailing_newline && !lines.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

fn apply_hunk(path: &Path, lines: &mut Vec<String>, hunk: &Hunk, crlf: bool) -> Result<(), PatchError> {
    let mut cursor = hunk.old_range().first_index();
    if cursor > lines.len() {
        return Err(PatchError::OutOfRange {
            path: path.to_path_buf(),
            range: hunk.old_range(),
            len: lines.len(),
        });
    }

    for line in hunk.lines() {
        match line.kind() {
            LineKind::Context => {
                expect_line(path, lines, cursor, line.content())?;
                cursor += 1;
            }
            LineKind::Remove => {
                expect_line(path, lines, cursor, line.content())?;
                lines.remove(cursor);
            }
            LineKind::Add => {
                let mut content = line.content().to_string();
                if crlf && !content.ends_with('\r') {
                    content.push('\r');
                }
                lines.insert(cursor, content);
                cursor += 1;
            }
        }
    }
    Ok(())
}

fn expect_line(path: &Path, lines: &[String], index: usize, expected: &str) -> Result<(), PatchError> {
    let actual = lines.get(index);
    let matches = actual.is_some_and(|a| a == expected || a.strip_suffix('\r') == Some(expected));
    if matches {
        return Ok(());
    }
    Err(PatchError::ContextMismatch {
        path: path.to_path_buf(),
        line: index + 1,
        expected: expected.to_string(),
        actual: actual.map_or_else(|| "<end of file>".to_string(), Clone::clone),
    })
}
