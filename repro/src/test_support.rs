//! Test-only collaborators: a scratch git repository, an in-memory
//! repository fake and a scripted run executor.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{
    ContentKey, EntryStatus, ExecutionPolicy, ModificationRecord, ParamValue, RegistrationEntry,
    RepoState, RunEvent, RunRecord, RunSpec, SubstitutionTable,
};
use crate::io::config::{CONFIG_RELATIVE_PATH, RecordConfig, write_config};
use crate::io::executor::RunExecutor;
use crate::io::repository::Repository;

pub const TEST_DATASET_ID: &str = "ds-test";

/// Temporary git repository with an identity and one initial commit
/// (`README.md` containing `hi`).
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "hi\n")?;
        repo.commit_all("init")?;
        Ok(repo)
    }

    /// Repository with `.repro/config.toml` carrying [`TEST_DATASET_ID`].
    pub fn with_dataset() -> Result<Self> {
        let repo = Self::new()?;
        let cfg = RecordConfig {
            dataset_id: Some(TEST_DATASET_ID.to_string()),
            ..RecordConfig::default()
        };
        write_config(&repo.path().join(CONFIG_RELATIVE_PATH), &cfg)?;
        repo.commit_all("configure dataset")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: impl AsRef<Path>, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: impl AsRef<Path>) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])
    }

    /// Initialize git-annex and move `paths` into the annex.
    pub fn annex_init(&self, paths: &[&str]) -> Result<()> {
        self.git(&["annex", "init", "--quiet", "test"])?;
        if !paths.is_empty() {
            let mut args = vec!["annex", "add", "--quiet", "--"];
            args.extend_from_slice(paths);
            self.git(&args)?;
            self.git(&["commit", "-q", "-m", "annex outputs"])?;
        }
        Ok(())
    }

    /// Stdout of a successful `git` invocation in the repository.
    pub fn git_stdout(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        self.git_stdout(args).map(drop)
    }
}

/// True when `git annex` can be run on this machine.
pub fn annex_available() -> bool {
    Command::new("git")
        .args(["annex", "version"])
        .output()
        .is_ok_and(|output| output.status.success())
}

#[derive(Debug, Default)]
struct FakeState {
    clean: bool,
    worktree: Vec<ModificationRecord>,
    /// Changes introduced by each commit; commit 0 is the initial state.
    commits: Vec<Vec<ModificationRecord>>,
    keys: BTreeMap<PathBuf, ContentKey>,
    failing_keys: BTreeSet<ContentKey>,
    registered: BTreeSet<(ContentKey, String)>,
    register_calls: Vec<Vec<RegistrationEntry>>,
}

/// In-memory repository with a linear commit history and an idempotent
/// URL store.
#[derive(Debug)]
pub struct FakeRepository {
    root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(FakeState {
                clean: true,
                commits: vec![Vec::new()],
                ..FakeState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake repository lock")
    }

    pub fn set_clean(&self, clean: bool) {
        self.lock().clean = clean;
    }

    /// Leave `changes` uncommitted in the worktree.
    pub fn set_worktree_changes(&self, changes: Vec<ModificationRecord>) {
        self.lock().worktree = changes;
    }

    /// Append a commit introducing `changes`.
    pub fn commit(&self, changes: Vec<ModificationRecord>) {
        self.lock().commits.push(changes);
    }

    pub fn head(&self) -> RepoState {
        state_name(self.lock().commits.len() - 1)
    }

    pub fn set_key(&self, path: impl Into<PathBuf>, key: &str) {
        self.lock().keys.insert(path.into(), ContentKey::new(key));
    }

    /// Make registration of `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.lock().failing_keys.insert(ContentKey::new(key));
    }

    pub fn registrations(&self) -> BTreeSet<(ContentKey, String)> {
        self.lock().registered.clone()
    }

    /// Entries of every `register` call, in call order.
    pub fn register_calls(&self) -> Vec<Vec<RegistrationEntry>> {
        self.lock().register_calls.clone()
    }
}

fn state_name(index: usize) -> RepoState {
    RepoState::new(format!("commit-{index}"))
}

fn state_index(state: &RepoState) -> Result<usize> {
    state
        .as_str()
        .strip_prefix("commit-")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("unknown state {state}"))
}

impl Repository for FakeRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_clean(&self) -> Result<bool> {
        let state = self.lock();
        Ok(state.clean && state.worktree.is_empty())
    }

    fn worktree_changes(&self) -> Result<Vec<ModificationRecord>> {
        Ok(self.lock().worktree.clone())
    }

    fn capture_state(&self) -> Result<RepoState> {
        Ok(self.head())
    }

    fn diff(&self, before: &RepoState, after: &RepoState) -> Result<Vec<ModificationRecord>> {
        let (from, to) = (state_index(before)?, state_index(after)?);
        let state = self.lock();
        if from > to || to >= state.commits.len() {
            return Err(anyhow!("cannot diff {before}..{after}"));
        }
        Ok(state.commits[from + 1..=to].concat())
    }

    fn resolve_content_keys(&self, paths: &[PathBuf]) -> Result<Vec<Option<ContentKey>>> {
        let state = self.lock();
        Ok(paths.iter().map(|p| state.keys.get(p).cloned()).collect())
    }

    fn register(&self, entries: &[RegistrationEntry]) -> Result<Vec<EntryStatus>> {
        let mut state = self.lock();
        state.register_calls.push(entries.to_vec());
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            if state.failing_keys.contains(&entry.key) {
                statuses.push(EntryStatus::Failed(format!("cannot register {}", entry.key)));
            } else {
                state
                    .registered
                    .insert((entry.key.clone(), entry.url.clone()));
                statuses.push(EntryStatus::Registered);
            }
        }
        Ok(statuses)
    }
}

/// Executor that replays predetermined events.
///
/// An optional effect runs before the events are emitted, standing in for
/// whatever the command does to the repository.
pub struct ScriptedExecutor<'a> {
    events: Vec<RunEvent>,
    effect: Option<Box<dyn Fn() + 'a>>,
    interrupt: Option<String>,
    seen_policy: Cell<Option<ExecutionPolicy>>,
}

impl<'a> ScriptedExecutor<'a> {
    pub fn new(events: Vec<RunEvent>) -> Self {
        Self {
            events,
            effect: None,
            interrupt: None,
            seen_policy: Cell::new(None),
        }
    }

    pub fn with_effect(mut self, effect: impl Fn() + 'a) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }

    /// Return `Err(message)` after emitting the scripted events.
    pub fn interrupted(mut self, message: &str) -> Self {
        self.interrupt = Some(message.to_string());
        self
    }

    pub fn seen_policy(&self) -> Option<ExecutionPolicy> {
        self.seen_policy.get()
    }
}

impl RunExecutor for ScriptedExecutor<'_> {
    fn execute(
        &self,
        _spec: &RunSpec,
        policy: &ExecutionPolicy,
        events: &mut dyn FnMut(RunEvent),
    ) -> Result<()> {
        self.seen_policy.set(Some(*policy));
        if let Some(effect) = &self.effect {
            effect();
        }
        for event in &self.events {
            events(event.clone());
        }
        match &self.interrupt {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

/// Run record whose templates are the given literal output paths.
pub fn run_record(record_id: Option<&str>, outputs: &[&str]) -> RunRecord {
    RunRecord {
        record_id: record_id.map(str::to_string),
        dataset_id: TEST_DATASET_ID.to_string(),
        cmd: "make".to_string(),
        inputs: Vec::new(),
        extra_inputs: Vec::new(),
        outputs: outputs.iter().map(|o| o.to_string()).collect(),
        expanded_inputs: Vec::new(),
        expanded_outputs: outputs.iter().map(PathBuf::from).collect(),
        substitutions: SubstitutionTable::new(),
    }
}

/// Substitution table from `(name, value)` pairs.
pub fn substitutions(pairs: &[(&str, &str)]) -> SubstitutionTable {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), ParamValue::from(*value)))
        .collect()
}
