//! Undo log for patch application
//!
//! Every mutating file operation appends an [`AppliedChange`] *before* it
//! touches the disk, so a change interrupted half-way is still undone.
//! Entries are replayed newest-first by [`UndoLog::rollback`].

use pilot_patch::FileOperation;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// What a committed operation needs to be reversed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// File was created; remove it and the directories made for it
    Created {
        /// New directories, deepest first
        created_dirs: Vec<PathBuf>,
    },
    /// File was rewritten; restore the pre-image
    Modified { original: Vec<u8> },
    /// File was removed; recreate it with the pre-image
    Deleted { original: Vec<u8> },
}

/// One undo-log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    path: PathBuf,
    kind: ChangeKind,
}

impl AppliedChange {
    /// Create new entry for an absolute workspace path
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Absolute path of the touched file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reversal data
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &ChangeKind {
        &self.kind
    }

    /// Operation that was performed
    #[must_use]
    pub fn operation(&self) -> FileOperation {
        match self.kind {
            ChangeKind::Created { .. } => FileOperation::Create,
            ChangeKind::Modified { .. } => FileOperation::Modify,
            ChangeKind::Deleted { .. } => FileOperation::Delete,
        }
    }

    /// Content before the operation (Modify/Delete only)
    #[must_use]
    pub fn pre_image(&self) -> Option<&[u8]> {
        match &self.kind {
            ChangeKind::Created { .. } => None,
            ChangeKind::Modified { original } | ChangeKind::Deleted { original } => Some(original),
        }
    }

    async fn undo(&self) -> std::io::Result<()> {
        match &self.kind {
            ChangeKind::Created { created_dirs } => {
                match tokio::fs::remove_file(&self.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                for dir in created_dirs {
                    // Only empty directories go; anything else stays put.
                    if tokio::fs::remove_dir(dir).await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            ChangeKind::Modified { original } => tokio::fs::write(&self.path, original).await,
            ChangeKind::Deleted { original } => {
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&self.path, original).await
            }
        }
    }
}

/// Undo entry that could not be replayed
#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    /// File that could not be restored
    pub path: PathBuf,
    /// IO error text
    pub message: String,
}

/// Outcome of a rollback
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    /// Entries successfully reversed
    pub restored: usize,
    /// Entries that failed; the rest were still attempted
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    /// Whether every entry was reversed
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered log of committed changes, owned by one patch engine
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Vec<AppliedChange>,
}

impl UndoLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    #[inline]
    pub fn record(&mut self, change: AppliedChange) {
        self.entries.push(change);
    }

    /// Entries in commit order
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[AppliedChange] {
        &self.entries
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget all entries, keeping the changes on disk
    #[inline]
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Reverse every entry newest-first, then empty the log
    ///
    /// Best-effort: a failing entry is reported and the rest still run.
    pub async fn rollback(&mut self) -> RollbackReport {
        let mut report = RollbackReport::default();
        while let Some(change) = self.entries.pop() {
            match change.undo().await {
                Ok(()) => {
                    tracing::debug!(path = %change.path.display(), op = %change.operation(), "undone");
                    report.restored += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %change.path.display(), error = %e, "rollback entry failed");
                    report.failures.push(RollbackFailure {
                        path: change.path.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }
}
