//! Error types for workspaces and patch application
//!
//! Three layers:
//! - [`WorkspaceError`]: store-level failures (create, populate, release)
//! - [`PatchError`]: expected per-file failures, reported in results
//! - [`PatchEngineError`]: failures that abort an apply call outright

use pilot_patch::{LineRange, ParseError};
use std::path::PathBuf;

/// Errors from the workspace store
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Target workspace directory is already present
    #[error("workspace already exists: {0}")]
    AlreadyExists(PathBuf),

    /// Project to copy from is missing or not a directory
    #[error("source project not found: {0}")]
    SourceMissing(PathBuf),

    /// Relative path would resolve outside the workspace root
    #[error("path '{path}' is not inside the workspace: {reason}")]
    PathEscapes { path: PathBuf, reason: &'static str },

    /// IO error on a workspace path
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Expected failure applying one file patch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// Create target already exists
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    /// Modify/Delete target is absent
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// Context or removed line differs from the file
    #[error("context mismatch in {path} at line {line}: expected {expected:?}, found {actual:?}")]
    ContextMismatch {
        path: PathBuf,
        line: usize,
        expected: String,
        actual: String,
    },

    /// Hunk anchored past the end of the file
    #[error("hunk {range} in {path} starts beyond end of file ({len} lines)")]
    OutOfRange {
        path: PathBuf,
        range: LineRange,
        len: usize,
    },

    /// Two hunks claim overlapping old-side lines
    #[error("overlapping hunks in {path}: -{first} and -{second}")]
    OverlappingHunks {
        path: PathBuf,
        first: LineRange,
        second: LineRange,
    },

    /// Modify target is not text
    #[error("file is not valid UTF-8: {0}")]
    NotUtf8(PathBuf),

    /// Patch path is absolute or climbs out of the workspace
    #[error("invalid patch path '{path}': {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

/// Errors aborting a whole apply call
#[derive(Debug, thiserror::Error)]
pub enum PatchEngineError {
    /// Diff text could not be parsed; nothing was touched
    #[error("patch parse error: {0}")]
    Parse(#[from] ParseError),

    /// Unexpected IO failure; raised after rollback completed
    #[error("io error while patching {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_mismatch_display_names_line_and_texts() {
        let err = PatchError::ContextMismatch {
            path: PathBuf::from("src/main.rs"),
            line: 7,
            expected: "fn main() {".to_string(),
            actual: "fn main(){".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("src/main.rs"));
        assert!(msg.contains("line 7"));
        assert!(msg.contains("fn main(){"));
    }

    #[test]
    fn already_exists_display() {
        let err = PatchError::AlreadyExists(PathBuf::from("a.txt"));
        assert_eq!(err.to_string(), "file already exists: a.txt");
    }

    #[test]
    fn parse_error_converts() {
        let err: PatchEngineError = ParseError::EmptyPatch.into();
        assert!(matches!(err, PatchEngineError::Parse(ParseError::EmptyPatch)));
    }

    #[test]
    fn io_error_keeps_source() {
        use std::error::Error as _;
        let err = WorkspaceError::io_error(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.source().is_some());
    }
}
