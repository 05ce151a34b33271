//! Orchestration for a single `repro record` invocation.
//!
//! The flow is a small state machine:
//! `Init → Precheck → Executing → {NoOutputs | StateCheck} → {IllegalMod | BuildUri}
//! → ResolveKeys → Registering → Done`. Every outcome is reported to a
//! [`ResultSink`]; only broken collaborator contracts and I/O failures
//! return `Err`.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::closure::variable_closure;
use crate::core::invariants::{InvariantViolation, require_record_id};
use crate::core::provenance::{build_repro_url, select_parameters};
use crate::core::types::{
    ExecutionPolicy, RECORD_ACTION, ResultDetail, ResultRecord, RunEvent, RunRecord, RunSpec,
    Status,
};
use crate::io::executor::{RUN_ACTION, RunExecutor};
use crate::io::repository::Repository;
use crate::register::{resolve_entries, submit_entries};
use crate::state_guard::{capture, check_modifications};

pub const NO_OUTPUTS_MESSAGE: &str = "no outputs to annotate (paths do not exist)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Precheck,
    Executing,
    NoOutputs,
    StateCheck,
    IllegalMod,
    BuildUri,
    ResolveKeys,
    Registering,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Init => "init",
            Phase::Precheck => "precheck",
            Phase::Executing => "executing",
            Phase::NoOutputs => "no_outputs",
            Phase::StateCheck => "state_check",
            Phase::IllegalMod => "illegal_mod",
            Phase::BuildUri => "build_uri",
            Phase::ResolveKeys => "resolve_keys",
            Phase::Registering => "registering",
            Phase::Done => "done",
        };
        f.write_str(label)
    }
}

/// Receiver of result records, in emission order.
pub trait ResultSink {
    fn emit(&mut self, record: ResultRecord);
}

impl ResultSink for Vec<ResultRecord> {
    fn emit(&mut self, record: ResultRecord) {
        self.push(record);
    }
}

/// Collaborators for one recording pass.
pub struct RecordContext<'a, R: ?Sized, E: ?Sized> {
    pub repo: &'a R,
    pub executor: &'a E,
    /// Sidecar directory, relative to the dataset root.
    pub runinfo_dir: &'a Path,
}

/// Where a recording pass stopped and what it registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub phase: Phase,
    pub url: Option<String>,
    pub registered: usize,
    pub failed: usize,
}

impl RecordOutcome {
    fn stopped(phase: Phase) -> Self {
        Self {
            phase,
            url: None,
            registered: 0,
            failed: 0,
        }
    }
}

fn enter(phase: &mut Phase, next: Phase) {
    debug!(from = %phase, to = %next, "phase transition");
    *phase = next;
}

fn summary(status: Status, message: impl Into<String>) -> ResultRecord {
    ResultRecord::new(
        RECORD_ACTION,
        status,
        message,
        ResultDetail::Summary {
            registered: 0,
            failed: 0,
            url: None,
        },
    )
}

/// Run `spec` and, if it reproduced its declared outputs without touching
/// anything else, register a provenance URL for every output.
#[instrument(skip_all, fields(cmd = %spec.cmd))]
pub fn record_reproducibility<R, E, S>(
    ctx: &RecordContext<'_, R, E>,
    spec: &RunSpec,
    sink: &mut S,
) -> Result<RecordOutcome>
where
    R: Repository + Sync + ?Sized,
    E: RunExecutor + ?Sized,
    S: ResultSink + ?Sized,
{
    let mut phase = Phase::Init;
    let root = ctx.repo.root();
    if let Err(err) = spec.validate() {
        sink.emit(ResultRecord::new(
            RECORD_ACTION,
            Status::Error,
            err.to_string(),
            ResultDetail::Validation,
        ));
        return Ok(RecordOutcome::stopped(phase));
    }

    enter(&mut phase, Phase::Precheck);
    if !ctx.repo.is_clean()? {
        info!("dataset has uncommitted changes");
        sink.emit(
            ResultRecord::new(
                RECORD_ACTION,
                Status::Impossible,
                "clean dataset required to detect changes from command; \
                 use `git status` to inspect unsaved changes",
                ResultDetail::Precheck,
            )
            .with_path(root),
        );
        return Ok(RecordOutcome::stopped(phase));
    }
    let before = capture(ctx.repo)?;

    enter(&mut phase, Phase::Executing);
    let policy = ExecutionPolicy::reproducibility();
    let mut records: Vec<RunRecord> = Vec::new();
    let mut run_failed = false;
    let executed = ctx.executor.execute(spec, &policy, &mut |event| match event {
        RunEvent::Status(result) => {
            run_failed |= result.status == Status::Error;
            sink.emit(result);
        }
        RunEvent::Record(record) => records.push(record),
    });
    if let Err(err) = executed {
        warn!(error = %format!("{err:#}"), "execution interrupted");
        run_failed = true;
        sink.emit(ResultRecord::new(
            RUN_ACTION,
            Status::Error,
            format!("execution interrupted: {err:#}"),
            ResultDetail::Run { record_id: None },
        ));
    }

    if run_failed {
        // Whatever the failed run left behind must be surfaced now.
        enter(&mut phase, Phase::StateCheck);
        let check = check_modifications(ctx.repo, &before, ctx.runinfo_dir)?;
        if !check.is_ok() {
            enter(&mut phase, Phase::IllegalMod);
            for result in check.problem_results(root) {
                sink.emit(result);
            }
        }
        sink.emit(summary(
            Status::Error,
            "command did not complete, nothing was registered",
        ));
        return Ok(RecordOutcome::stopped(phase));
    }

    if spec.dry_run {
        sink.emit(summary(Status::Ok, "dry run, nothing was recorded"));
        return Ok(RecordOutcome::stopped(phase));
    }

    if records.len() > 1 {
        return Err(InvariantViolation::MultipleRunRecords {
            count: records.len(),
        }
        .into());
    }
    let record = match records.pop() {
        Some(record) if !record.expanded_outputs.is_empty() => record,
        _ => {
            enter(&mut phase, Phase::NoOutputs);
            sink.emit(summary(Status::Impossible, NO_OUTPUTS_MESSAGE));
            return Ok(RecordOutcome::stopped(phase));
        }
    };
    let record_id = require_record_id(&record)?.to_string();
    sink.emit(ResultRecord::new(
        RUN_ACTION,
        Status::Ok,
        format!("recorded run of `{}`", record.cmd),
        ResultDetail::Run {
            record_id: Some(record_id.clone()),
        },
    ));

    enter(&mut phase, Phase::StateCheck);
    let check = check_modifications(ctx.repo, &before, ctx.runinfo_dir)?;
    if !check.is_ok() {
        enter(&mut phase, Phase::IllegalMod);
        for result in check.problem_results(root) {
            sink.emit(result);
        }
        sink.emit(summary(
            Status::Error,
            "dataset modified beyond the run record, nothing was registered",
        ));
        return Ok(RecordOutcome::stopped(phase));
    }

    enter(&mut phase, Phase::BuildUri);
    let required = variable_closure(record.templates());
    let params = select_parameters(&required, &record.substitutions)?;
    let url = build_repro_url(&record.dataset_id, &check.after, &record_id, &params);
    info!(%url, "provenance URL built");

    enter(&mut phase, Phase::ResolveKeys);
    let jobs = spec.jobs.unwrap_or(1);
    let resolved = resolve_entries(ctx.repo, &record.expanded_outputs, &url, jobs)?;

    enter(&mut phase, Phase::Registering);
    let report = submit_entries(ctx.repo, resolved)?;
    for result in report.results(root) {
        sink.emit(result);
    }
    let (registered, failed) = (report.registered(), report.failed());
    let mut message = format!("registered provenance URL for {registered} output(s)");
    if failed > 0 {
        message.push_str(&format!(", {failed} failed"));
    }
    if !report.skipped.is_empty() {
        message.push_str(&format!(
            ", {} not content-addressed",
            report.skipped.len()
        ));
    }
    sink.emit(ResultRecord::new(
        RECORD_ACTION,
        Status::Ok,
        message,
        ResultDetail::Summary {
            registered,
            failed,
            url: Some(url.clone()),
        },
    ));

    enter(&mut phase, Phase::Done);
    Ok(RecordOutcome {
        phase,
        url: Some(url),
        registered,
        failed,
    })
}
