//! Git adapter.
//!
//! Recording relies on exact repository state, so we keep a small, explicit
//! wrapper around `git` subprocess calls instead of a library binding.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::{ModState, ModificationRecord};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    /// Modification state implied by the XY code.
    pub fn state(&self) -> ModState {
        match self.code.as_str() {
            "??" => ModState::Added,
            code if code.contains('R') => ModState::Renamed,
            code if code.contains('D') => ModState::Deleted,
            code if code.contains('A') => ModState::Added,
            _ => ModState::Modified,
        }
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Absolute path of the repository containing the working directory.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to record)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full commit SHA that `rev` points to.
    pub fn commit_sha(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// True when there are no staged, unstaged or untracked changes.
    pub fn is_clean(&self) -> Result<bool> {
        let entries = self.status_porcelain()?;
        if !entries.is_empty() {
            debug!(changed = entries.len(), "worktree not clean");
        }
        Ok(entries.is_empty())
    }

    /// Uncommitted changes, untracked files included.
    pub fn worktree_changes(&self) -> Result<Vec<ModificationRecord>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .map(|entry| ModificationRecord::new(&entry.path, entry.state()))
            .collect())
    }

    /// Path-level differences between two commits.
    #[instrument(skip_all, fields(from = %from, to = %to))]
    pub fn diff_name_status(&self, from: &str, to: &str) -> Result<Vec<ModificationRecord>> {
        let out = self.run_capture(&["diff", "--name-status", "-M", "-z", from, to, "--"])?;
        parse_name_status(&out)
    }

    /// Value of a git config key, `None` when unset.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let output = self.run(&["config", "--get", key])?;
        match output.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            )),
            Some(1) => Ok(None),
            _ => Err(anyhow!(
                "git config --get {key} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// True if `path` is known to the index.
    pub fn is_tracked(&self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy();
        let output = self.run(&["ls-files", "--error-unmatch", "--", &path])?;
        Ok(output.status.success())
    }

    /// Restore `paths` in the worktree and index from HEAD.
    pub fn restore_paths(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["checkout".to_string(), "HEAD".to_string(), "--".to_string()];
        args.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args)?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-q", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Parse `git diff --name-status -z` output.
///
/// Renames and copies carry two paths; the destination is reported.
fn parse_name_status(out: &str) -> Result<Vec<ModificationRecord>> {
    let mut fields = out.split('\0').filter(|f| !f.is_empty());
    let mut records = Vec::new();
    while let Some(code) = fields.next() {
        let kind = code
            .chars()
            .next()
            .ok_or_else(|| anyhow!("empty diff status"))?;
        let state = match kind {
            'A' | 'C' => ModState::Added,
            'M' | 'T' => ModState::Modified,
            'D' => ModState::Deleted,
            'R' => ModState::Renamed,
            other => return Err(anyhow!("unexpected diff status '{other}'")),
        };
        let mut path = fields
            .next()
            .ok_or_else(|| anyhow!("diff status '{code}' without path"))?;
        if matches!(kind, 'R' | 'C') {
            path = fields
                .next()
                .ok_or_else(|| anyhow!("diff status '{code}' without destination path"))?;
        }
        records.push(ModificationRecord::new(path, state));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn status_codes_map_to_states() {
        let state = |line: &str| parse_status_line(line).expect("parse").state();
        assert_eq!(state("?? new.txt"), ModState::Added);
        assert_eq!(state(" M README.md"), ModState::Modified);
        assert_eq!(state(" D gone.txt"), ModState::Deleted);
        assert_eq!(state("A  staged.txt"), ModState::Added);
        assert_eq!(state("R  old.txt -> new.txt"), ModState::Renamed);
    }

    #[test]
    fn worktree_changes_report_edits_and_untracked_files() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(git.worktree_changes().expect("changes").is_empty());

        repo.write("README.md", "edited\n").expect("write");
        repo.write("scratch.txt", "x").expect("write");
        assert_eq!(
            git.worktree_changes().expect("changes"),
            vec![
                ModificationRecord::new("README.md", ModState::Modified),
                ModificationRecord::new("scratch.txt", ModState::Added),
            ]
        );
    }

    #[test]
    fn parses_name_status_records() {
        let out = "A\0.repro/runinfo/abc\0M\0other.txt\0D\0gone.txt\0R087\0old.txt\0new.txt\0";
        let records = parse_name_status(out).expect("parse");
        assert_eq!(
            records,
            vec![
                ModificationRecord::new(".repro/runinfo/abc", ModState::Added),
                ModificationRecord::new("other.txt", ModState::Modified),
                ModificationRecord::new("gone.txt", ModState::Deleted),
                ModificationRecord::new("new.txt", ModState::Renamed),
            ]
        );
    }

    #[test]
    fn name_status_rejects_truncated_rename() {
        assert!(parse_name_status("R100\0old.txt\0").is_err());
    }

    #[test]
    fn diff_between_commits_reports_changes() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let before = git.commit_sha("HEAD").expect("sha");

        repo.write("README.md", "changed\n").expect("write");
        repo.write("added.txt", "new\n").expect("write");
        repo.commit_all("second").expect("commit");
        let after = git.commit_sha("HEAD").expect("sha");

        let records = git.diff_name_status(&before, &after).expect("diff");
        assert_eq!(
            records,
            vec![
                ModificationRecord::new("README.md", ModState::Modified),
                ModificationRecord::new("added.txt", ModState::Added),
            ]
        );
        assert!(git.diff_name_status(&after, &after).expect("diff").is_empty());
    }

    #[test]
    fn cleanliness_tracks_untracked_files() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(git.is_clean().expect("status"));
        repo.write("scratch.txt", "x").expect("write");
        assert!(!git.is_clean().expect("status"));
    }

    #[test]
    fn restore_paths_recovers_deleted_file() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        std::fs::remove_file(repo.path().join("README.md")).expect("remove");
        assert!(git.is_tracked(Path::new("README.md")).expect("tracked"));

        git.restore_paths(&[PathBuf::from("README.md")])
            .expect("restore");
        assert!(git.is_clean().expect("status"));
    }

    #[test]
    fn config_get_distinguishes_missing_keys() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert_eq!(
            git.config_get("user.name").expect("config"),
            Some("test".to_string())
        );
        assert_eq!(git.config_get("annex.uuid").expect("config"), None);
    }
}
