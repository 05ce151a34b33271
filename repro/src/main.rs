//! Reproducibility recorder.
//!
//! `repro record` runs a command in a clean dataset, verifies that it
//! regenerates its declared outputs and registers a provenance URL for each
//! of them. Result records are printed to stdout as JSON lines.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use repro::core::types::{Expand, ResultRecord, RunSpec, Status};
use repro::exit_codes;
use repro::io::annex::AnnexRepository;
use repro::io::config::{CONFIG_RELATIVE_PATH, load_config};
use repro::io::executor::ShellRunExecutor;
use repro::io::git::Git;
use repro::io::init::{InitOptions, init_dataset};
use repro::logging;
use repro::record::{RecordContext, ResultSink, record_reproducibility};

#[derive(Parser)]
#[command(
    name = "repro",
    version,
    about = "Record verifiable reproducibility provenance for dataset outputs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assign a dataset id in `.repro/config.toml` and commit it.
    Init {
        /// Replace an existing dataset id.
        #[arg(short, long)]
        force: bool,
        /// Dataset to initialize.
        #[arg(short, long, default_value = ".")]
        dataset: PathBuf,
    },
    /// Re-run a command and register provenance for the outputs it reproduces.
    Record(RecordArgs),
}

#[derive(Args)]
struct RecordArgs {
    /// Command template; `{name}` placeholders are substituted before running.
    ///
    /// A single argument is passed to `sh -c` as written. Several arguments
    /// are shell-quoted and joined, so `-- sh -c 'echo a > x'` keeps its
    /// quoting.
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    cmd: Vec<String>,
    /// Input path template (repeatable).
    #[arg(short, long = "input", value_name = "PATH")]
    inputs: Vec<String>,
    /// Output path template (repeatable, at least one required).
    #[arg(short, long = "output", value_name = "PATH")]
    outputs: Vec<String>,
    /// Additional dependency path template (repeatable).
    #[arg(long = "extra-input", value_name = "PATH")]
    extra_inputs: Vec<String>,
    /// Persist expanded path lists next to their templates.
    #[arg(long, value_enum)]
    expand: Option<ExpandArg>,
    /// Show the rendered command without running or recording anything.
    #[arg(long)]
    dry_run: bool,
    /// Parallel content-key lookups.
    #[arg(short = 'J', long)]
    jobs: Option<usize>,
    /// Dataset to record in.
    #[arg(short, long, default_value = ".")]
    dataset: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExpandArg {
    Inputs,
    Outputs,
    Both,
}

impl From<ExpandArg> for Expand {
    fn from(value: ExpandArg) -> Self {
        match value {
            ExpandArg::Inputs => Expand::Inputs,
            ExpandArg::Outputs => Expand::Outputs,
            ExpandArg::Both => Expand::Both,
        }
    }
}

impl RecordArgs {
    fn run_spec(&self) -> Result<RunSpec> {
        Ok(RunSpec {
            cmd: command_line(&self.cmd)?,
            inputs: self.inputs.clone(),
            extra_inputs: self.extra_inputs.clone(),
            outputs: self.outputs.clone(),
            expand: self.expand.map(Expand::from),
            dry_run: self.dry_run,
            jobs: self.jobs,
        })
    }
}

/// Rebuild a shell command line from argv. Words made only of shell-safe
/// characters and placeholder braces stay bare so list placeholders still
/// split into separate words.
fn command_line(argv: &[String]) -> Result<String> {
    if let [single] = argv {
        return Ok(single.clone());
    }
    let words = argv
        .iter()
        .map(|arg| {
            let bare = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_=/,.+:@%{}[]".contains(c));
            if bare {
                Ok(arg.clone())
            } else {
                shlex::try_quote(arg)
                    .map(|quoted| quoted.into_owned())
                    .with_context(|| format!("cannot quote command argument {arg:?}"))
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(words.join(" "))
}

/// Writes each record as one JSON line and remembers the worst status.
struct JsonLinesSink<W> {
    out: W,
    worst: Option<Status>,
    error: Option<io::Error>,
}

impl<W: Write> JsonLinesSink<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            worst: None,
            error: None,
        }
    }

    fn finish(mut self) -> Result<Option<Status>> {
        if let Some(err) = self.error.take() {
            return Err(err).context("write result records");
        }
        self.out.flush().context("flush result records")?;
        Ok(self.worst)
    }
}

impl<W: Write> ResultSink for JsonLinesSink<W> {
    fn emit(&mut self, record: ResultRecord) {
        self.worst = self.worst.max(Some(record.status));
        if self.error.is_some() {
            return;
        }
        let written = serde_json::to_writer(&mut self.out, &record)
            .map_err(io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        if let Err(err) = written {
            self.error = Some(err);
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, dataset } => cmd_init(&dataset, force),
        Command::Record(args) => cmd_record(&args),
    }
}

fn dataset_root(dataset: &Path) -> Result<PathBuf> {
    Git::new(dataset)
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", dataset.display()))
}

fn cmd_init(dataset: &Path, force: bool) -> Result<i32> {
    let root = dataset_root(dataset)?;
    let outcome = init_dataset(&root, &InitOptions { force })?;
    println!("{}", outcome.dataset_id);
    Ok(exit_codes::OK)
}

fn cmd_record(args: &RecordArgs) -> Result<i32> {
    let root = dataset_root(&args.dataset)?;
    let cfg = load_config(&root.join(CONFIG_RELATIVE_PATH))?;
    cfg.require_dataset_id()?;
    let repo = AnnexRepository::open(&root, cfg.process_limits());
    let runinfo_dir = cfg.runinfo_dir.clone();
    let executor = ShellRunExecutor::new(&root, cfg);
    let ctx = RecordContext {
        repo: &repo,
        executor: &executor,
        runinfo_dir: &runinfo_dir,
    };

    let mut sink = JsonLinesSink::new(io::stdout().lock());
    record_reproducibility(&ctx, &args.run_spec()?, &mut sink)?;
    let worst = sink.finish()?;
    Ok(exit_codes::for_worst_status(worst))
}
