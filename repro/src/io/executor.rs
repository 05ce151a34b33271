//! Run-execution collaborator.
//!
//! The [`RunExecutor`] trait decouples recording from how a command is
//! actually run and saved. [`ShellRunExecutor`] runs the command with `sh -c`
//! in the dataset root and commits the result together with a run-record
//! sidecar. Tests use scripted executors that emit predetermined events.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::closure::render_template;
use crate::core::types::{
    ExecutionPolicy, ParamValue, ResultDetail, ResultRecord, RunEvent, RunRecord, RunSpec, Status,
    SubstitutionTable,
};
use crate::io::annex::{annex_add, annex_initialized};
use crate::io::config::RecordConfig;
use crate::io::git::Git;
use crate::io::process::run_bounded;
use crate::io::sidecar::{Sidecar, write_sidecar};

pub const RUN_ACTION: &str = "run";
pub const REMOVE_ACTION: &str = "remove";

/// Abstraction over run execution backends.
pub trait RunExecutor {
    /// Execute `spec` under `policy`, reporting progress through `events`.
    ///
    /// At most one [`RunEvent::Record`] is emitted, as the last event of a
    /// run that completed. `Err` means the run was interrupted; events
    /// already emitted stay valid.
    fn execute(
        &self,
        spec: &RunSpec,
        policy: &ExecutionPolicy,
        events: &mut dyn FnMut(RunEvent),
    ) -> Result<()>;
}

/// Executor that runs commands through `sh -c` in the dataset root.
#[derive(Debug, Clone)]
pub struct ShellRunExecutor {
    root: PathBuf,
    config: RecordConfig,
}

impl ShellRunExecutor {
    pub fn new(root: impl Into<PathBuf>, config: RecordConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Delete existing outputs, recording each deleted path in `removed`
    /// as it goes.
    fn remove_outputs(
        &self,
        outputs: &[PathBuf],
        removed: &mut Vec<PathBuf>,
        events: &mut dyn FnMut(RunEvent),
    ) -> Result<()> {
        for rel in outputs {
            let abs = self.root.join(rel);
            let Ok(meta) = fs::symlink_metadata(&abs) else {
                continue;
            };
            let removal = if meta.is_dir() {
                fs::remove_dir_all(&abs)
            } else {
                fs::remove_file(&abs)
            };
            removal.with_context(|| format!("remove output {}", abs.display()))?;
            events(RunEvent::Status(
                ResultRecord::new(
                    REMOVE_ACTION,
                    Status::Ok,
                    "removed declared output before run",
                    ResultDetail::Run { record_id: None },
                )
                .with_path(abs),
            ));
            removed.push(rel.clone());
        }
        Ok(())
    }

    /// Put removed outputs that git knows about back in place.
    fn restore_outputs(&self, git: &Git, removed: &[PathBuf]) -> Result<()> {
        let mut tracked = Vec::new();
        for path in removed {
            if git.is_tracked(path)? {
                tracked.push(path.clone());
            }
        }
        debug!(restored = tracked.len(), "restoring removed outputs");
        git.restore_paths(&tracked)
    }

    /// Stage outputs and everything else the command changed, then commit.
    fn save(&self, git: &Git, produced: &[PathBuf], cmd: &str, record_id: &str) -> Result<()> {
        if annex_initialized(git)? {
            annex_add(&self.root, produced, &self.config.process_limits())?;
        }
        git.add_all()?;
        let summary = cmd.lines().next().unwrap_or_default();
        let message = format!("[REPRO RUN] {summary}\n\nrecord: {record_id}\n");
        if !git.commit_staged(&message)? {
            warn!("run produced nothing to commit");
        }
        Ok(())
    }

    /// Run the planned command and save what it produced. Outputs listed in
    /// `removed` were deleted beforehand.
    fn run_and_save(
        &self,
        spec: &RunSpec,
        policy: &ExecutionPolicy,
        plan: RunPlan,
        dataset_id: String,
        removed: &[PathBuf],
        events: &mut dyn FnMut(RunEvent),
    ) -> Result<()> {
        let git = Git::new(&self.root);
        info!(command = %plan.command, "running command");
        let limits = self.config.process_limits();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&plan.command).current_dir(&self.root);
        let out = run_bounded(cmd, None, &limits).context("run recorded command")?;
        if !out.success() {
            let stderr = out.stderr_text();
            let mut message = format!("command {}", out.describe_exit(&limits));
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr);
            }
            warn!(%message, "recorded command failed");
            events(RunEvent::Status(ResultRecord::new(
                RUN_ACTION,
                Status::Error,
                message,
                ResultDetail::Run { record_id: None },
            )));
            if policy.stop_on_failure {
                self.restore_outputs(&git, removed)?;
                return Ok(());
            }
        }

        let produced: Vec<PathBuf> = plan
            .outputs
            .iter()
            .filter(|rel| fs::symlink_metadata(self.root.join(rel)).is_ok())
            .cloned()
            .collect();
        if produced.is_empty() {
            info!("no declared output was produced");
            self.restore_outputs(&git, removed)?;
            events(RunEvent::Record(RunRecord {
                record_id: None,
                dataset_id,
                cmd: spec.cmd.clone(),
                inputs: spec.inputs.clone(),
                extra_inputs: spec.extra_inputs.clone(),
                outputs: spec.outputs.clone(),
                expanded_inputs: plan.inputs,
                expanded_outputs: Vec::new(),
                substitutions: plan.substitutions,
            }));
            return Ok(());
        }

        let expand = spec.expand;
        let sidecar = Sidecar {
            dataset_id: dataset_id.clone(),
            cmd: spec.cmd.clone(),
            inputs: spec.inputs.clone(),
            extra_inputs: spec.extra_inputs.clone(),
            outputs: spec.outputs.clone(),
            expand,
            expanded_inputs: if expand.is_some_and(|e| e.inputs()) {
                plan.inputs.clone()
            } else {
                Vec::new()
            },
            expanded_outputs: if expand.is_some_and(|e| e.outputs()) {
                produced.clone()
            } else {
                Vec::new()
            },
            substitutions: plan.substitutions.clone(),
            exit: out.status.code().unwrap_or_default(),
            recorded_at: Utc::now(),
        };
        let written = write_sidecar(&self.root, &self.config.runinfo_dir, &sidecar)?;
        self.save(&git, &produced, &spec.cmd, &written.record_id)?;

        let mut record = RunRecord {
            record_id: Some(written.record_id),
            dataset_id,
            cmd: spec.cmd.clone(),
            inputs: spec.inputs.clone(),
            extra_inputs: spec.extra_inputs.clone(),
            outputs: spec.outputs.clone(),
            expanded_inputs: plan.inputs,
            expanded_outputs: produced,
            substitutions: plan.substitutions,
        };
        if !policy.parametric_record {
            record.inputs = paths_as_strings(&record.expanded_inputs);
            record.outputs = paths_as_strings(&record.expanded_outputs);
        }
        events(RunEvent::Record(record));
        Ok(())
    }
}

impl RunExecutor for ShellRunExecutor {
    #[instrument(skip_all, fields(cmd = %spec.cmd, dry_run = spec.dry_run))]
    fn execute(
        &self,
        spec: &RunSpec,
        policy: &ExecutionPolicy,
        events: &mut dyn FnMut(RunEvent),
    ) -> Result<()> {
        let dataset_id = self.config.require_dataset_id()?.to_string();
        let tmpdir = tempfile::Builder::new()
            .prefix("repro-")
            .tempdir()
            .context("create run tmpdir")?;
        let plan = plan_run(&self.root, spec, &self.config.substitutions, tmpdir.path())?;

        if spec.dry_run {
            events(RunEvent::Status(ResultRecord::new(
                RUN_ACTION,
                Status::Ok,
                format!("dry run, would execute: {}", plan.command),
                ResultDetail::Run { record_id: None },
            )));
            return Ok(());
        }

        let mut removed = Vec::new();
        let mut result = Ok(());
        if policy.remove_outputs {
            result = self.remove_outputs(&plan.outputs, &mut removed, events);
        }
        let result = result
            .and_then(|()| self.run_and_save(spec, policy, plan, dataset_id, &removed, events));
        if result.is_err()
            && !removed.is_empty()
            && let Err(err) = self.restore_outputs(&Git::new(&self.root), &removed)
        {
            warn!(error = %format!("{err:#}"), "could not restore removed outputs");
        }
        result
    }
}


/// Rendered form of a [`RunSpec`] for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunPlan {
    command: String,
    inputs: Vec<PathBuf>,
    extra_inputs: Vec<PathBuf>,
    outputs: Vec<PathBuf>,
    substitutions: SubstitutionTable,
}

fn plan_run(
    root: &Path,
    spec: &RunSpec,
    configured: &SubstitutionTable,
    tmpdir: &Path,
) -> Result<RunPlan> {
    let mut table = configured.clone();
    let root_str = root.to_string_lossy().into_owned();
    table.insert("pwd".to_string(), ParamValue::One(root_str.clone()));
    table.insert("dspath".to_string(), ParamValue::One(root_str));
    table.insert(
        "tmpdir".to_string(),
        ParamValue::One(tmpdir.to_string_lossy().into_owned()),
    );

    let inputs = render_paths(root, &spec.inputs, &table)?;
    let extra_inputs = render_paths(root, &spec.extra_inputs, &table)?;
    let outputs = render_paths(root, &spec.outputs, &table)?;
    table.insert(
        "inputs".to_string(),
        ParamValue::Many(paths_as_strings(&inputs)),
    );
    table.insert(
        "outputs".to_string(),
        ParamValue::Many(paths_as_strings(&outputs)),
    );
    let command = render_template(&spec.cmd, &table)?;
    Ok(RunPlan {
        command,
        inputs,
        extra_inputs,
        outputs,
        substitutions: table,
    })
}

fn render_paths(root: &Path, templates: &[String], table: &SubstitutionTable) -> Result<Vec<PathBuf>> {
    templates
        .iter()
        .map(|template| {
            let rendered = render_template(template, table)?;
            dataset_relative(root, Path::new(&rendered))
        })
        .collect()
}

/// Normalize `path` to a path relative to `root`, refusing anything outside.
fn dataset_relative(root: &Path, path: &Path) -> Result<PathBuf> {
    let rel = if path.is_absolute() {
        path.strip_prefix(root).map_err(|_| {
            anyhow!(
                "path {} is outside the dataset {}",
                path.display(),
                root.display()
            )
        })?
    } else {
        path
    };
    let mut normalized = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => {
                return Err(anyhow!(
                    "path {} must stay inside the dataset",
                    path.display()
                ));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(anyhow!("path '{}' names the dataset root", path.display()));
    }
    Ok(normalized)
}

fn paths_as_strings(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Expand;
    use crate::io::sidecar::load_sidecar;
    use crate::test_support::TestRepo;

    fn config() -> RecordConfig {
        RecordConfig {
            dataset_id: Some("ds-test".to_string()),
            ..RecordConfig::default()
        }
    }

    fn collect(executor: &ShellRunExecutor, spec: &RunSpec) -> (Result<()>, Vec<RunEvent>) {
        let mut events = Vec::new();
        let result = executor.execute(spec, &ExecutionPolicy::reproducibility(), &mut |e| {
            events.push(e);
        });
        (result, events)
    }

    fn last_record(events: &[RunEvent]) -> Option<&RunRecord> {
        events.iter().rev().find_map(|e| match e {
            RunEvent::Record(record) => Some(record),
            RunEvent::Status(_) => None,
        })
    }

    #[test]
    fn plan_renders_paths_and_command() {
        let mut configured = SubstitutionTable::new();
        configured.insert("subject".to_string(), ParamValue::from("sub-01"));
        let spec = RunSpec::new("cp {inputs} {outputs[0]}")
            .with_inputs(["./in/{subject}.csv"])
            .with_outputs(["out/{subject}.csv"]);
        let root = Path::new("/ds");

        let plan = plan_run(root, &spec, &configured, Path::new("/tmp/x")).expect("plan");
        assert_eq!(plan.command, "cp in/sub-01.csv out/sub-01.csv");
        assert_eq!(plan.inputs, vec![PathBuf::from("in/sub-01.csv")]);
        assert_eq!(plan.outputs, vec![PathBuf::from("out/sub-01.csv")]);
        assert_eq!(plan.substitutions["pwd"], ParamValue::from("/ds"));
    }

    #[test]
    fn plan_rejects_paths_outside_dataset() {
        let spec = RunSpec::new("true").with_outputs(["../escape.txt"]);
        let err = plan_run(
            Path::new("/ds"),
            &spec,
            &SubstitutionTable::new(),
            Path::new("/tmp"),
        )
        .expect_err("outside");
        assert!(err.to_string().contains("inside the dataset"));

        assert_eq!(
            dataset_relative(Path::new("/ds"), Path::new("/ds/a/b.txt")).expect("rel"),
            PathBuf::from("a/b.txt")
        );
        assert!(dataset_relative(Path::new("/ds"), Path::new("/other/b.txt")).is_err());
    }

    #[test]
    fn reproducing_run_commits_sidecar() {
        let repo = TestRepo::new().expect("repo");
        repo.write("file1.txt", "123\n").expect("write");
        repo.commit_all("add file1").expect("commit");
        let git = Git::new(repo.path());
        let before = git.commit_sha("HEAD").expect("sha");

        let executor = ShellRunExecutor::new(repo.path(), config());
        let mut spec = RunSpec::new("echo \"123\" > file1.txt").with_outputs(["file1.txt"]);
        spec.expand = Some(Expand::Both);
        let (result, events) = collect(&executor, &spec);
        result.expect("execute");

        let record = last_record(&events).expect("record");
        let record_id = record.record_id.clone().expect("record id");
        assert_eq!(record.expanded_outputs, vec![PathBuf::from("file1.txt")]);
        assert_eq!(record.dataset_id, "ds-test");

        let after = git.commit_sha("HEAD").expect("sha");
        let diff = git.diff_name_status(&before, &after).expect("diff");
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, Path::new(".repro/runinfo").join(&record_id));
        assert!(git.is_clean().expect("status"));

        let sidecar = load_sidecar(&repo.path().join(&diff[0].path)).expect("sidecar");
        assert_eq!(sidecar.outputs, vec!["file1.txt".to_string()]);
        assert_eq!(sidecar.expanded_outputs, vec![PathBuf::from("file1.txt")]);
    }

    #[test]
    fn missing_outputs_are_restored_without_commit() {
        let repo = TestRepo::new().expect("repo");
        repo.write("file1.txt", "123\n").expect("write");
        repo.commit_all("add file1").expect("commit");
        let git = Git::new(repo.path());
        let before = git.commit_sha("HEAD").expect("sha");

        let executor = ShellRunExecutor::new(repo.path(), config());
        let spec = RunSpec::new("echo").with_outputs(["file1.txt"]);
        let (result, events) = collect(&executor, &spec);
        result.expect("execute");

        let record = last_record(&events).expect("record");
        assert!(record.record_id.is_none());
        assert!(record.expanded_outputs.is_empty());
        assert_eq!(git.commit_sha("HEAD").expect("sha"), before);
        assert!(git.is_clean().expect("status"));
    }

    #[test]
    fn failing_command_reports_error_and_stops() {
        let repo = TestRepo::new().expect("repo");
        repo.write("file1.txt", "123\n").expect("write");
        repo.commit_all("add file1").expect("commit");

        let executor = ShellRunExecutor::new(repo.path(), config());
        let spec = RunSpec::new("echo boom >&2; exit 4").with_outputs(["file1.txt"]);
        let (result, events) = collect(&executor, &spec);
        result.expect("execute");

        assert!(last_record(&events).is_none());
        let error = events
            .iter()
            .find_map(|e| match e {
                RunEvent::Status(r) if r.status == Status::Error => Some(r),
                _ => None,
            })
            .expect("error event");
        assert!(error.message.contains("exited with status 4"));
        assert!(error.message.contains("boom"));
        assert!(repo.path().join("file1.txt").exists());
    }

    #[test]
    fn failed_save_restores_removed_outputs() {
        let repo = TestRepo::new().expect("repo");
        repo.write("file1.txt", "123\n").expect("write");
        // A file where the sidecar directory should go makes the sidecar write fail.
        repo.write(".repro/runinfo", "blocked\n").expect("write");
        repo.commit_all("add file1").expect("commit");

        let executor = ShellRunExecutor::new(repo.path(), config());
        let spec = RunSpec::new("echo \"456\" > file1.txt").with_outputs(["file1.txt"]);
        let (result, events) = collect(&executor, &spec);

        assert!(result.is_err());
        assert!(last_record(&events).is_none());
        assert_eq!(repo.read("file1.txt").expect("read"), "123\n");
        assert!(Git::new(repo.path()).is_clean().expect("status"));
    }

    #[test]
    fn dry_run_executes_nothing() {
        let repo = TestRepo::new().expect("repo");
        let executor = ShellRunExecutor::new(repo.path(), config());
        let mut spec = RunSpec::new("touch {outputs}").with_outputs(["made.txt"]);
        spec.dry_run = true;
        let (result, events) = collect(&executor, &spec);
        result.expect("execute");

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RunEvent::Status(r) if r.message.contains("touch made.txt")));
        assert!(!repo.path().join("made.txt").exists());
    }

    #[test]
    fn missing_dataset_id_is_an_error() {
        let repo = TestRepo::new().expect("repo");
        let executor = ShellRunExecutor::new(repo.path(), RecordConfig::default());
        let spec = RunSpec::new("true").with_outputs(["x"]);
        let (result, events) = collect(&executor, &spec);
        assert!(result.is_err());
        assert!(events.is_empty());
    }
}
