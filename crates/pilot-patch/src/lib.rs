//! Pilot Patch
//!
//! Pure, filesystem-free handling of unified diffs.
//!
//! # Core Concepts
//!
//! - [`FilePatch`]: all changes for one target path, with its [`FileOperation`]
//! - [`Hunk`]: one region of change, with declared old/new [`LineRange`]s
//! - [`DiffLine`]: a context, added or removed line
//! - [`PatchParser`]: converts diff text into file patches
//!
//! # Example
//!
//! ```rust
//! use pilot_patch::{parse_patch, FileOperation};
//!
//! let text = "--- /dev/null\n+++ b/hello.txt\n@@ -0,0 +1 @@\n+hello\n";
//! let files = parse_patch(text).unwrap();
//! assert_eq!(files[0].operation(), FileOperation::Create);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
mod model;
mod parser;

// Re-exports
pub use model::{
    DiffLine, FileOperation, FilePatch, Hunk, HunkCountError, HunkSide, LineKind, LineRange,
};
pub use parser::{parse_patch, ParseError, PatchParser};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
