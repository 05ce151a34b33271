//! I/O helpers for recording runs: git, git-annex, processes and files.

pub mod annex;
pub mod config;
pub mod executor;
pub mod git;
pub mod init;
pub mod process;
pub mod repository;
pub mod sidecar;
