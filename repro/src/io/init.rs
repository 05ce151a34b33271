//! Initialization of `.repro/` scaffolding in a dataset.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::info;
use uuid::Uuid;

use crate::io::config::{CONFIG_RELATIVE_PATH, RecordConfig, load_config, write_config};
use crate::io::git::Git;

/// Canonical recorder paths for a dataset root.
#[derive(Debug, Clone)]
pub struct DatasetPaths {
    pub root: PathBuf,
    pub repro_dir: PathBuf,
    pub config_path: PathBuf,
}

impl DatasetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config_path = root.join(CONFIG_RELATIVE_PATH);
        Self {
            repro_dir: root.join(".repro"),
            config_path,
            root,
        }
    }
}

/// Options for `init_dataset`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Replace an existing dataset id.
    pub force: bool,
}

/// Outcome of `repro init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    pub dataset_id: String,
    pub committed: bool,
}

/// Assign a dataset id in `.repro/config.toml` and commit it.
///
/// Existing configuration keys are preserved. Fails when the dataset already
/// has an id unless `options.force` is set, or when the worktree is dirty.
pub fn init_dataset(root: &Path, options: &InitOptions) -> Result<InitOutcome> {
    let git = Git::new(root);
    if !git.is_clean()? {
        return Err(anyhow!(
            "repro init: clean dataset required (commit or stash changes first)"
        ));
    }
    let paths = DatasetPaths::new(root);
    let mut cfg = if paths.config_path.exists() {
        load_config(&paths.config_path)?
    } else {
        RecordConfig::default()
    };
    if let Some(existing) = &cfg.dataset_id
        && !options.force
    {
        return Err(anyhow!(
            "repro init: dataset already has id '{existing}' (use --force to replace)"
        ));
    }

    let dataset_id = Uuid::new_v4().to_string();
    cfg.dataset_id = Some(dataset_id.clone());
    write_config(&paths.config_path, &cfg)?;

    git.add_all()?;
    let committed = git.commit_staged("[REPRO] initialize dataset")?;
    info!(%dataset_id, committed, "dataset initialized");
    Ok(InitOutcome {
        dataset_id,
        committed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn init_writes_and_commits_dataset_id() {
        let repo = TestRepo::new().expect("repo");
        let outcome = init_dataset(repo.path(), &InitOptions { force: false }).expect("init");
        assert!(outcome.committed);

        let cfg = load_config(&DatasetPaths::new(repo.path()).config_path).expect("load");
        assert_eq!(cfg.dataset_id.as_deref(), Some(outcome.dataset_id.as_str()));
        assert!(Git::new(repo.path()).is_clean().expect("status"));
    }

    #[test]
    fn init_refuses_to_replace_id_without_force() {
        let repo = TestRepo::new().expect("repo");
        let first = init_dataset(repo.path(), &InitOptions { force: false }).expect("init");
        assert!(init_dataset(repo.path(), &InitOptions { force: false }).is_err());

        let second = init_dataset(repo.path(), &InitOptions { force: true }).expect("force");
        assert_ne!(first.dataset_id, second.dataset_id);
    }

    #[test]
    fn init_refuses_dirty_worktree() {
        let repo = TestRepo::new().expect("repo");
        repo.write("scratch.txt", "x").expect("write");
        assert!(init_dataset(repo.path(), &InitOptions { force: false }).is_err());
    }
}
