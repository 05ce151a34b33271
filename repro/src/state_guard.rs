//! Before/after repository state checks around a recorded run.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::classifier::classify_modifications;
use crate::core::types::{
    ModificationRecord, RECORD_ACTION, RepoState, ResultDetail, ResultRecord, Status,
};
use crate::io::repository::Repository;

pub const ILLEGAL_MODIFICATION: &str = "illegal dataset modification";

/// Outcome of comparing the post-run state against the pre-run state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCheck {
    pub before: RepoState,
    pub after: RepoState,
    pub problems: Vec<ModificationRecord>,
}

impl StateCheck {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    /// One `error` record per offending path, with absolute paths.
    pub fn problem_results(&self, root: &Path) -> Vec<ResultRecord> {
        let hint = format!(
            "reset the dataset to {} (e.g. `git reset --hard {}`) before retrying",
            self.before, self.before
        );
        self.problems
            .iter()
            .map(|problem| {
                ResultRecord::new(
                    RECORD_ACTION,
                    Status::Error,
                    ILLEGAL_MODIFICATION,
                    ResultDetail::Modification {
                        state: problem.state,
                        hint: hint.clone(),
                    },
                )
                .with_path(root.join(&problem.path))
            })
            .collect()
    }
}

#[instrument(skip_all)]
pub fn capture<R: Repository + ?Sized>(repo: &R) -> Result<RepoState> {
    let state = repo.capture_state()?;
    debug!(%state, "captured state");
    Ok(state)
}

/// Capture the post-run state, diff it against `before` and classify the
/// changes. Only the first sidecar addition under `sidecar_dir` is allowed.
#[instrument(skip_all, fields(before = %before))]
pub fn check_modifications<R: Repository + ?Sized>(
    repo: &R,
    before: &RepoState,
    sidecar_dir: &Path,
) -> Result<StateCheck> {
    let after = capture(repo)?;
    let records = repo.diff(before, &after)?;
    let mut problems = classify_modifications(&records, sidecar_dir).problems;
    let uncommitted = repo.worktree_changes()?;
    if !uncommitted.is_empty() {
        warn!(paths = uncommitted.len(), "run left uncommitted changes");
    }
    for change in uncommitted {
        if !problems.iter().any(|p| p.path == change.path) {
            problems.push(change);
        }
    }
    if !problems.is_empty() {
        warn!(
            problems = problems.len(),
            "run modified the dataset beyond its sidecar"
        );
    }
    Ok(StateCheck {
        before: before.clone(),
        after,
        problems,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ModState;
    use crate::test_support::FakeRepository;

    #[test]
    fn sidecar_only_change_is_ok() {
        let repo = FakeRepository::new("/ds");
        let before = capture(&repo).expect("capture");
        repo.commit(vec![ModificationRecord::new(
            ".repro/runinfo/abc",
            ModState::Added,
        )]);

        let check = check_modifications(&repo, &before, Path::new(".repro/runinfo")).expect("check");
        assert!(check.is_ok());
        assert_ne!(check.after, before);
    }

    #[test]
    fn problems_span_every_commit_since_before() {
        let repo = FakeRepository::new("/ds");
        let before = capture(&repo).expect("capture");
        repo.commit(vec![ModificationRecord::new(
            ".repro/runinfo/abc",
            ModState::Added,
        )]);
        repo.commit(vec![
            ModificationRecord::new(".repro/runinfo/def", ModState::Added),
            ModificationRecord::new("notes.txt", ModState::Modified),
        ]);

        let check = check_modifications(&repo, &before, Path::new(".repro/runinfo")).expect("check");
        assert_eq!(
            check.problems,
            vec![
                ModificationRecord::new(".repro/runinfo/def", ModState::Added),
                ModificationRecord::new("notes.txt", ModState::Modified),
            ]
        );

        let results = check.problem_results(Path::new("/ds"));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == Status::Error));
        assert_eq!(results[1].message, ILLEGAL_MODIFICATION);
        assert_eq!(results[1].path.as_deref(), Some(Path::new("/ds/notes.txt")));
        assert!(matches!(
            &results[1].detail,
            ResultDetail::Modification { state: ModState::Modified, hint } if hint.contains("commit-0")
        ));
    }

    #[test]
    fn uncommitted_changes_are_problems() {
        let repo = FakeRepository::new("/ds");
        let before = capture(&repo).expect("capture");
        repo.commit(vec![ModificationRecord::new("notes.txt", ModState::Modified)]);
        repo.set_worktree_changes(vec![
            ModificationRecord::new("notes.txt", ModState::Modified),
            ModificationRecord::new("README.md", ModState::Modified),
            ModificationRecord::new("scratch.txt", ModState::Added),
        ]);

        let check = check_modifications(&repo, &before, Path::new(".repro/runinfo")).expect("check");
        assert_eq!(
            check.problems,
            vec![
                ModificationRecord::new("notes.txt", ModState::Modified),
                ModificationRecord::new("README.md", ModState::Modified),
                ModificationRecord::new("scratch.txt", ModState::Added),
            ]
        );
    }

    #[test]
    fn unchanged_state_is_ok() {
        let repo = FakeRepository::new("/ds");
        let before = capture(&repo).expect("capture");
        let check = check_modifications(&repo, &before, Path::new(".repro/runinfo")).expect("check");
        assert!(check.is_ok());
        assert_eq!(check.after, before);
    }
}
