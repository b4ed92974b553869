//! Pilot Workspace
//!
//! Disposable per-run copies of a project and the transactional engine that
//! applies patches to them.
//!
//! # Core Concepts
//!
//! - [`WorkspaceStore`]: owns one run's directory; create, populate, resolve,
//!   snapshot, release
//! - [`PatchEngine`]: all-or-nothing application of [`pilot_patch::FilePatch`]es
//! - [`UndoLog`]: pre-images recorded before every mutation
//! - [`ContentHash`]: Blake3 fingerprints for before/after comparison

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod engine;
mod error;
mod hash;
mod store;
mod undo;

pub use engine::{apply_hunks, FileResult, PatchApplicationResult, PatchEngine};
pub use error::{PatchEngineError, PatchError, WorkspaceError};
pub use hash::ContentHash;
pub use store::{PopulateOptions, PopulateReport, Released, Retention, WorkspaceStore};
pub use undo::{AppliedChange, ChangeKind, RollbackFailure, RollbackReport, UndoLog};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
