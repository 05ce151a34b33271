//! Repository collaborator abstraction.
//!
//! The [`Repository`] trait is everything the recorder needs from the
//! version-controlled dataset: state snapshots, diffs, content keys and a
//! content store that accepts URL registrations. [`crate::io::annex`]
//! implements it on top of git and git-annex; tests use an in-memory fake.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::core::types::{ContentKey, EntryStatus, ModificationRecord, RegistrationEntry, RepoState};

pub trait Repository {
    /// Absolute dataset root. Paths exchanged with the trait are relative to it.
    fn root(&self) -> &Path;

    /// True when the worktree has no uncommitted or untracked changes.
    fn is_clean(&self) -> Result<bool>;

    /// Uncommitted worktree changes, untracked files included.
    fn worktree_changes(&self) -> Result<Vec<ModificationRecord>>;

    /// Synchronize the tracked counterpart of the current branch and return
    /// its reference.
    fn capture_state(&self) -> Result<RepoState>;

    /// Path-level differences between two captured states.
    fn diff(&self, before: &RepoState, after: &RepoState) -> Result<Vec<ModificationRecord>>;

    /// Content key for each path, aligned with `paths`. `None` for paths that
    /// are tracked but not content-addressed.
    fn resolve_content_keys(&self, paths: &[PathBuf]) -> Result<Vec<Option<ContentKey>>>;

    /// Register all entries in one batched call.
    ///
    /// Must not fetch content, derive metadata from the URL, or commit to the
    /// tracked branch. Returns one status per entry, aligned with `entries`.
    /// `Err` is reserved for failures of the call as a whole.
    fn register(&self, entries: &[RegistrationEntry]) -> Result<Vec<EntryStatus>>;
}
