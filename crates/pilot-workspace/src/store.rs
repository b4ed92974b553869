//! Disposable per-run workspace directories
//!
//! A [`WorkspaceStore`] owns one directory under a base path. It is populated
//! from the user's project, mutated by the patch engine, and finally released
//! according to its [`Retention`] policy. The user's project is never written.

use crate::error::WorkspaceError;
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// What happens to a workspace directory on release
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Leave it on disk for inspection
    #[default]
    Keep,
    /// Delete it
    Remove,
}

/// Filter applied while copying the project in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulateOptions {
    /// Entry names skipped at any depth
    pub exclude: Vec<String>,
    /// Files larger than this are skipped
    pub max_file_bytes: Option<u64>,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            exclude: [".git", "target", "node_modules", ".venv", "__pycache__"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_file_bytes: Some(8 * 1024 * 1024),
        }
    }
}

impl PopulateOptions {
    /// Copy everything
    #[must_use]
    pub fn unfiltered() -> Self {
        Self {
            exclude: Vec::new(),
            max_file_bytes: None,
        }
    }

    /// Replace the exclusion list
    #[must_use]
    pub fn with_exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-file size cap
    #[must_use]
    pub fn with_max_file_bytes(mut self, max: Option<u64>) -> Self {
        self.max_file_bytes = max;
        self
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|e| e == name)
    }
}

/// Summary of a populate call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PopulateReport {
    /// Files copied
    pub files_copied: usize,
    /// Bytes copied
    pub bytes_copied: u64,
    /// Relative paths left out (excluded, oversized, or symlinks)
    pub skipped: Vec<PathBuf>,
}

/// Result of [`WorkspaceStore::release`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    /// Directory left on disk
    Kept(PathBuf),
    /// Directory deleted
    Removed(PathBuf),
}

/// One run's isolated copy of the project
#[derive(Debug)]
pub struct WorkspaceStore {
    root: PathBuf,
    retention: Retention,
    released: bool,
}

impl WorkspaceStore {
    /// Create `base/name`; fails if it already exists
    pub async fn create(
        base: impl AsRef<Path>,
        name: &str,
        retention: Retention,
    ) -> Result<Self, WorkspaceError> {
        let base = base.as_ref();
        tokio::fs::create_dir_all(base)
            .await
            .map_err(|e| WorkspaceError::io_error(base, e))?;

        let root = base.join(name);
        match tokio::fs::create_dir(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists(root));
            }
            Err(e) => return Err(WorkspaceError::io_error(root, e)),
        }

        tracing::debug!(root = %root.display(), ?retention, "workspace created");
        Ok(Self {
            root,
            retention,
            released: false,
        })
    }

    /// Absolute workspace root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Release policy
    #[inline]
    #[must_use]
    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Copy `source` into the workspace, honoring `options`
    ///
    /// Symlinks are not followed and are reported as skipped.
    pub async fn populate(
        &self,
        source: impl AsRef<Path>,
        options: &PopulateOptions,
    ) -> Result<PopulateReport, WorkspaceError> {
        let source = source.as_ref();
        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(WorkspaceError::SourceMissing(source.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(WorkspaceError::SourceMissing(source.to_path_buf()));
            }
            Err(e) => return Err(WorkspaceError::io_error(source, e)),
        }

        let mut report = PopulateReport::default();
        let mut pending = vec![PathBuf::new()];

        while let Some(rel_dir) = pending.pop() {
            let src_dir = source.join(&rel_dir);
            let mut entries = tokio::fs::read_dir(&src_dir)
                .await
                .map_err(|e| WorkspaceError::io_error(&src_dir, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| WorkspaceError::io_error(&src_dir, e))?
            {
                let name = entry.file_name();
                let rel = rel_dir.join(&name);
                if options.is_excluded(&name.to_string_lossy()) {
                    report.skipped.push(rel);
                    continue;
                }

                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| WorkspaceError::io_error(entry.path(), e))?;
                let dst = self.root.join(&rel);

                if file_type.is_dir() {
                    tokio::fs::create_dir_all(&dst)
                        .await
                        .map_err(|e| WorkspaceError::io_error(&dst, e))?;
                    pending.push(rel);
                } else if file_type.is_file() {
                    let len = entry
                        .metadata()
                        .await
                        .map_err(|e| WorkspaceError::io_error(entry.path(), e))?
                        .len();
                    if options.max_file_bytes.is_some_and(|max| len > max) {
                        tracing::debug!(path = %rel.display(), len, "skipping oversized file");
                        report.skipped.push(rel);
                        continue;
                    }
                    let copied = tokio::fs::copy(entry.path(), &dst)
                        .await
                        .map_err(|e| WorkspaceError::io_error(&dst, e))?;
                    report.files_copied += 1;
                    report.bytes_copied += copied;
                } else {
                    report.skipped.push(rel);
                }
            }
        }

        report.skipped.sort();
        tracing::info!(
            root = %self.root.display(),
            files = report.files_copied,
            bytes = report.bytes_copied,
            skipped = report.skipped.len(),
            "workspace populated"
        );
        Ok(report)
    }

    /// Map a workspace-relative path to an absolute one
    ///
    /// Absolute paths and any `..` component are rejected, so the result
    /// always lies under [`root`](Self::root).
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf, WorkspaceError> {
        let relative = relative.as_ref();
        let escapes = |reason| WorkspaceError::PathEscapes {
            path: relative.to_path_buf(),
            reason,
        };

        let mut normal = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(_) => normal += 1,
                Component::CurDir => {}
                Component::ParentDir => return Err(escapes("parent directory component")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(escapes("absolute path"));
                }
            }
        }
        if normal == 0 {
            return Err(escapes("empty path"));
        }
        Ok(self.root.join(relative))
    }

    /// Content hash of every regular file, keyed by relative path
    pub async fn snapshot(&self) -> Result<BTreeMap<PathBuf, ContentHash>, WorkspaceError> {
        let mut hashes = BTreeMap::new();
        let mut pending = vec![PathBuf::new()];

        while let Some(rel_dir) = pending.pop() {
            let dir = self.root.join(&rel_dir);
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| WorkspaceError::io_error(&dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| WorkspaceError::io_error(&dir, e))?
            {
                let rel = rel_dir.join(entry.file_name());
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| WorkspaceError::io_error(entry.path(), e))?;
                if file_type.is_dir() {
                    pending.push(rel);
                } else if file_type.is_file() {
                    let bytes = tokio::fs::read(entry.path())
                        .await
                        .map_err(|e| WorkspaceError::io_error(entry.path(), e))?;
                    hashes.insert(rel, ContentHash::compute(&bytes));
                }
            }
        }
        Ok(hashes)
    }

    /// Read a workspace file as text
    pub async fn read_to_string(&self, relative: impl AsRef<Path>) -> Result<String, WorkspaceError> {
        let path = self.resolve(relative)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| WorkspaceError::io_error(path, e))
    }

    /// Apply the retention policy; consumes the store
    pub async fn release(mut self) -> Result<Released, WorkspaceError> {
        self.released = true;
        let root = self.root.clone();
        match self.retention {
            Retention::Keep => {
                tracing::info!(root = %root.display(), "workspace kept");
                Ok(Released::Kept(root))
            }
            Retention::Remove => {
                tokio::fs::remove_dir_all(&root)
                    .await
                    .map_err(|e| WorkspaceError::io_error(&root, e))?;
                tracing::info!(root = %root.display(), "workspace removed");
                Ok(Released::Removed(root))
            }
        }
    }
}

impl Drop for WorkspaceStore {
    fn drop(&mut self) {
        if !self.released && self.retention == Retention::Remove {
            tracing::warn!(root = %self.root.display(), "workspace dropped without release; removing");
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}
