//! Repository implementation backed by git and git-annex.
//!
//! Content keys and URL registration go through `git annex` batch mode so
//! that a whole output set costs one subprocess per operation.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ContentKey, EntryStatus, ModificationRecord, RegistrationEntry, RepoState};
use crate::io::git::Git;
use crate::io::process::{ProcessLimits, run_bounded};
use crate::io::repository::Repository;

const NO_RESPONSE: &str = "no response from git-annex for this entry";

/// Dataset repository using git for history and git-annex as content store.
#[derive(Debug, Clone)]
pub struct AnnexRepository {
    root: PathBuf,
    git: Git,
    limits: ProcessLimits,
}

impl AnnexRepository {
    pub fn open(root: impl Into<PathBuf>, limits: ProcessLimits) -> Self {
        let root = root.into();
        Self {
            git: Git::new(&root),
            root,
            limits,
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Commit adjusted-branch changes back to the corresponding branch
    /// without touching remotes or content.
    #[instrument(skip_all)]
    fn sync_corresponding_branch(&self) -> Result<()> {
        let cmd = annex_command(
            &self.root,
            &[
                "sync",
                "--no-push",
                "--no-pull",
                "--no-content",
                "--no-commit",
                "--no-resolvemerge",
                "--quiet",
            ],
        );
        let out = run_bounded(cmd, None, &self.limits).context("git annex sync")?;
        if !out.success() {
            return Err(anyhow!(
                "git annex sync {}: {}",
                out.describe_exit(&self.limits),
                out.stderr_text()
            ));
        }
        Ok(())
    }
}

impl Repository for AnnexRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_clean(&self) -> Result<bool> {
        self.git.is_clean()
    }

    fn worktree_changes(&self) -> Result<Vec<ModificationRecord>> {
        self.git.worktree_changes()
    }

    #[instrument(skip_all)]
    fn capture_state(&self) -> Result<RepoState> {
        let branch = self.git.current_branch()?;
        let tracked = match corresponding_branch(&branch) {
            Some(original) => {
                debug!(adjusted = %branch, original, "syncing adjusted branch");
                self.sync_corresponding_branch()?;
                original.to_string()
            }
            None => branch,
        };
        let sha = self.git.commit_sha(&format!("refs/heads/{tracked}"))?;
        debug!(branch = %tracked, %sha, "captured repository state");
        Ok(RepoState::new(sha))
    }

    fn diff(&self, before: &RepoState, after: &RepoState) -> Result<Vec<ModificationRecord>> {
        if before == after {
            return Ok(Vec::new());
        }
        self.git.diff_name_status(before.as_str(), after.as_str())
    }

    #[instrument(skip_all, fields(paths = paths.len()))]
    fn resolve_content_keys(&self, paths: &[PathBuf]) -> Result<Vec<Option<ContentKey>>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        if !annex_initialized(&self.git)? {
            debug!("no annex in dataset, nothing is content-addressed");
            return Ok(vec![None; paths.len()]);
        }
        let input = batch_input(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        let cmd = annex_command(&self.root, &["lookupkey", "--batch"]);
        let out = run_bounded(cmd, Some(input.as_bytes()), &self.limits)
            .context("git annex lookupkey")?;
        if !out.success() {
            return Err(anyhow!(
                "git annex lookupkey {}: {}",
                out.describe_exit(&self.limits),
                out.stderr_text()
            ));
        }
        parse_lookupkey_output(&out.stdout_text(), paths.len())
    }

    #[instrument(skip_all, fields(entries = entries.len()))]
    fn register(&self, entries: &[RegistrationEntry]) -> Result<Vec<EntryStatus>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let input = batch_input(entries.iter().map(|e| format!("{} {}", e.key, e.url)));
        let cmd = annex_command(
            &self.root,
            &["registerurl", "--batch", "--json", "--json-error-messages"],
        );
        // A nonzero exit only means some entry failed; per-entry results carry the detail.
        let out = run_bounded(cmd, Some(input.as_bytes()), &self.limits)
            .context("git annex registerurl")?;
        if out.timed_out {
            return Err(anyhow!(
                "git annex registerurl {}",
                out.describe_exit(&self.limits)
            ));
        }
        let statuses = parse_registerurl_output(&out.stdout_text(), entries.len());
        let failed = statuses
            .iter()
            .filter(|s| matches!(s, EntryStatus::Failed(_)))
            .count();
        if failed > 0 {
            warn!(failed, stderr = %out.stderr_text(), "some registrations failed");
        }
        info!(registered = entries.len() - failed, failed, "registration batch done");
        Ok(statuses)
    }
}

/// True if git-annex has been initialized in the repository.
pub fn annex_initialized(git: &Git) -> Result<bool> {
    Ok(git.config_get("annex.uuid")?.is_some())
}

/// Add `paths` to the annex.
pub fn annex_add(root: &Path, paths: &[PathBuf], limits: &ProcessLimits) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let mut cmd = annex_command(root, &["add", "--quiet", "--"]);
    cmd.args(paths);
    let out = run_bounded(cmd, None, limits).context("git annex add")?;
    if !out.success() {
        return Err(anyhow!(
            "git annex add {}: {}",
            out.describe_exit(limits),
            out.stderr_text()
        ));
    }
    Ok(())
}

/// Branch whose history an adjusted branch mirrors.
///
/// `adjusted/main(unlocked)` corresponds to `main`; other names have no
/// counterpart.
pub fn corresponding_branch(branch: &str) -> Option<&str> {
    let rest = branch.strip_prefix("adjusted/")?;
    let (original, mode) = rest.split_once('(')?;
    if original.is_empty() || !mode.ends_with(')') {
        return None;
    }
    Some(original)
}

fn annex_command(root: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("annex").args(args).current_dir(root);
    cmd
}

fn batch_input(lines: impl Iterator<Item = String>) -> String {
    let mut input = String::new();
    for line in lines {
        input.push_str(&line);
        input.push('\n');
    }
    input
}

fn parse_lookupkey_output(stdout: &str, expected: usize) -> Result<Vec<Option<ContentKey>>> {
    let keys: Vec<Option<ContentKey>> = stdout
        .lines()
        .map(|line| {
            let line = line.trim();
            (!line.is_empty()).then(|| ContentKey::new(line))
        })
        .collect();
    if keys.len() != expected {
        return Err(anyhow!(
            "git annex lookupkey answered {} of {} paths",
            keys.len(),
            expected
        ));
    }
    Ok(keys)
}

#[derive(Debug, Deserialize)]
struct AnnexJsonResult {
    success: bool,
    #[serde(default, rename = "error-messages")]
    error_messages: Vec<String>,
    #[serde(default)]
    note: Option<String>,
}

/// Map batch JSON lines onto entries by position.
fn parse_registerurl_output(stdout: &str, expected: usize) -> Vec<EntryStatus> {
    let mut statuses: Vec<EntryStatus> = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(expected)
        .map(|line| match serde_json::from_str::<AnnexJsonResult>(line) {
            Ok(result) if result.success => EntryStatus::Registered,
            Ok(result) => {
                let message = if result.error_messages.is_empty() {
                    result.note.unwrap_or_else(|| "registration failed".to_string())
                } else {
                    result.error_messages.join("; ")
                };
                EntryStatus::Failed(message)
            }
            Err(err) => EntryStatus::Failed(format!("unparseable git-annex response: {err}")),
        })
        .collect();
    statuses.resize(expected, EntryStatus::Failed(NO_RESPONSE.to_string()));
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::time::Duration;

    fn limits() -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(30),
            output_limit_bytes: 100_000,
        }
    }

    #[test]
    fn adjusted_branches_map_to_original() {
        assert_eq!(corresponding_branch("adjusted/main(unlocked)"), Some("main"));
        assert_eq!(
            corresponding_branch("adjusted/feature/x(hidemissing)"),
            Some("feature/x")
        );
        assert_eq!(corresponding_branch("main"), None);
        assert_eq!(corresponding_branch("adjusted/(unlocked)"), None);
        assert_eq!(corresponding_branch("adjusted/main"), None);
    }

    #[test]
    fn lookupkey_output_keeps_alignment() {
        let keys = parse_lookupkey_output("MD5E-s4--abc.txt\n\nSHA256E-s1--d\n", 3).expect("parse");
        assert_eq!(
            keys,
            vec![
                Some(ContentKey::new("MD5E-s4--abc.txt")),
                None,
                Some(ContentKey::new("SHA256E-s1--d")),
            ]
        );
    }

    #[test]
    fn lookupkey_output_count_mismatch_is_error() {
        assert!(parse_lookupkey_output("KEY\n", 2).is_err());
    }

    #[test]
    fn registerurl_output_maps_per_entry() {
        let stdout = concat!(
            r#"{"command":"registerurl","success":true,"error-messages":[]}"#,
            "\n",
            r#"{"command":"registerurl","success":false,"error-messages":["bad key"]}"#,
            "\n",
            "garbage\n"
        );
        let statuses = parse_registerurl_output(stdout, 4);
        assert_eq!(statuses[0], EntryStatus::Registered);
        assert_eq!(statuses[1], EntryStatus::Failed("bad key".to_string()));
        assert!(matches!(&statuses[2], EntryStatus::Failed(msg) if msg.contains("unparseable")));
        assert_eq!(statuses[3], EntryStatus::Failed(NO_RESPONSE.to_string()));
    }

    #[test]
    fn plain_git_dataset_has_no_content_keys() {
        let repo = TestRepo::new().expect("repo");
        let annex = AnnexRepository::open(repo.path(), limits());
        let keys = annex
            .resolve_content_keys(&[PathBuf::from("README.md")])
            .expect("resolve");
        assert_eq!(keys, vec![None]);
    }

    #[test]
    fn capture_state_follows_branch_head() {
        let repo = TestRepo::new().expect("repo");
        let annex = AnnexRepository::open(repo.path(), limits());
        let before = annex.capture_state().expect("capture");
        assert_eq!(before.as_str(), annex.git().commit_sha("HEAD").expect("sha"));

        repo.write("new.txt", "x\n").expect("write");
        repo.commit_all("add").expect("commit");
        let after = annex.capture_state().expect("capture");
        assert_ne!(before, after);
        assert_eq!(
            annex.diff(&before, &after).expect("diff").len(),
            1
        );
        assert!(annex.diff(&after, &after).expect("diff").is_empty());
    }
}
