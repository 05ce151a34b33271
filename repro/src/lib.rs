//! Reproducibility recording for version-controlled datasets.
//!
//! `repro record` runs a command with its declared outputs removed, checks
//! that the run regenerated them without touching anything else in the
//! dataset, and attaches a `repro://` provenance URL to each output's
//! content key. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (placeholder closures, URL
//!   construction, modification classification). No I/O.
//! - **[`io`]**: Side-effecting collaborators (git, git-annex, command
//!   execution, sidecar files, configuration), behind traits where the
//!   orchestrator consumes them.
//!
//! Orchestration modules ([`record`], [`state_guard`], [`register`])
//! compose core logic with I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod record;
pub mod register;
pub mod state_guard;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
