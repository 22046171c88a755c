//! The command-line surface: one flat set of global options (scheduler
//! address, namespace, token, verbosity) shared by every subcommand, plus a
//! `WatchArgs` block of output/termination knobs flattened into each
//! subcommand that actually watches something.
//!
//! Every option doubles as an environment variable via clap's `env`
//! attribute, the same idiom the teacher's `cli.rs` uses for its backend
//! connection settings.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use nomad_watch_core::StreamKind;
use regex::Regex;

fn parse_task_regex(input: &str) -> Result<Regex, String> {
    Regex::new(input).map_err(|e| format!("invalid --task regex: {e}"))
}

/// Which of the four output streams a `--out` value selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutSelect {
    /// All four streams.
    All,
    /// Allocation task-event lines only.
    Alloc,
    /// Task stdout only.
    Stdout,
    /// Task stderr only.
    Stderr,
    /// Evaluation status lines only.
    Eval,
    /// Nothing (exit-code-only mode).
    None,
}

impl OutSelect {
    /// Expands a list of `--out` selections into the concrete stream kinds
    /// the output formatter should emit.
    pub fn resolve(selections: &[OutSelect]) -> Vec<StreamKind> {
        if selections.is_empty() || selections.contains(&OutSelect::All) {
            return vec![StreamKind::Eval, StreamKind::Alloc, StreamKind::Stdout, StreamKind::Stderr];
        }
        if selections.contains(&OutSelect::None) {
            return Vec::new();
        }
        selections
            .iter()
            .filter_map(|s| match s {
                OutSelect::Alloc => Some(StreamKind::Alloc),
                OutSelect::Stdout => Some(StreamKind::Stdout),
                OutSelect::Stderr => Some(StreamKind::Stderr),
                OutSelect::Eval => Some(StreamKind::Eval),
                OutSelect::All | OutSelect::None => None,
            })
            .collect()
    }
}

/// Global options shared by every subcommand.
#[derive(Debug, Parser)]
#[command(name = "nomad-watch", version, about = "Observe a scheduler job through to a terminal condition")]
pub struct Cli {
    /// Subcommand selecting which terminal condition to drive toward.
    #[command(subcommand)]
    pub command: Command,

    /// Scheduler base address.
    #[arg(long, global = true, env = "NOMAD_ADDR", default_value = "http://127.0.0.1:4646")]
    pub address: String,

    /// Namespace to operate in; `*` is treated as `default`.
    #[arg(long, global = true, env = "NOMAD_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Bearer token attached to every scheduler request.
    #[arg(long, global = true, env = "NOMAD_TOKEN")]
    pub token: Option<String>,

    /// Increase log verbosity; repeatable.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Bypass the event stream; poll for state on a fixed cadence instead.
    #[arg(long, global = true, env = "NOMAD_WATCH_POLLING")]
    pub polling: bool,
}

/// The seven job/alloc-observing subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a job spec and watch it until finished.
    Run(RunArgs),
    /// Watch an already-registered job until finished.
    Job(JobArgs),
    /// Submit a job spec and watch it until started.
    Start(RunArgs),
    /// Watch an already-registered job until started.
    Started(JobArgs),
    /// Stop a job and watch it until finished.
    Stop(JobArgs),
    /// Watch a job already being stopped, until finished.
    Stopped(JobArgs),
    /// Watch a single allocation's tasks until finished.
    Alloc(AllocArgs),
}

/// Arguments for `run`/`start`: a job spec file plus the watch knobs.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to a job specification file.
    pub jobfile: PathBuf,
    /// The job spec file is already in the scheduler's native JSON format.
    #[arg(long)]
    pub json: bool,
    #[command(flatten)]
    pub watch: WatchArgs,
}

/// Arguments for `job`/`started`/`stop`/`stopped`: a job (or `job@group@task`) argument.
#[derive(Debug, Args)]
pub struct JobArgs {
    /// `JOB`, `JOB@GROUP`, or `JOB@GROUP@TASK`.
    pub job: String,
    #[command(flatten)]
    pub watch: WatchArgs,
}

/// Arguments for `alloc`: a single allocation id.
#[derive(Debug, Args)]
pub struct AllocArgs {
    /// Allocation identifier to watch.
    pub allocid: String,
    #[command(flatten)]
    pub watch: WatchArgs,
}

/// Output selection and termination knobs shared by every watching subcommand.
#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    /// Disable the job-version filter; follow every version of the job.
    #[arg(long)]
    pub all: bool,

    /// Which streams to print; repeatable, comma-separated.
    #[arg(long, value_enum, value_delimiter = ',')]
    pub out: Vec<OutSelect>,

    /// Stop the job when this watcher exits.
    #[arg(long)]
    pub attach: bool,

    /// Purge the job on stop.
    #[arg(long)]
    pub purge: bool,

    /// Only purge if the job finished (or is running) with no failures.
    #[arg(long)]
    pub purge_successful: bool,

    /// Keep at most this many recent allocation-event/log lines per task
    /// during the initial quiet window.
    #[arg(long)]
    pub lines: Option<usize>,

    /// Length of the initial quiet window, in seconds.
    #[arg(long, default_value_t = 0.5)]
    pub lines_timeout: f64,

    /// Deadline for draining log streamers on shutdown, in seconds.
    #[arg(long, default_value_t = 2.0)]
    pub shutdown_timeout: f64,

    /// Alias for `--all --lines 10`.
    #[arg(long)]
    pub follow: bool,

    /// Stop after `--shutdown-timeout` instead of waiting for termination.
    #[arg(long)]
    pub no_follow: bool,

    /// Restrict output to tasks whose name matches this regex.
    #[arg(long, value_parser = parse_task_regex)]
    pub task: Option<Regex>,

    /// Collapse the until-finished exit code to success/interrupted only.
    #[arg(long)]
    pub no_preserve_status: bool,

    /// Prefix every line with its event/log timestamp.
    #[arg(short = 'T', long)]
    pub log_timestamp: bool,

    /// `chrono` format string for `--log-timestamp`.
    #[arg(long)]
    pub log_timestamp_format: Option<String>,

    /// Omit the task-group name from line prefixes.
    #[arg(short = 'G', long)]
    pub log_no_group: bool,

    /// Omit the task name from line prefixes.
    #[arg(long)]
    pub log_no_task: bool,

    /// Print the full allocation id instead of its 8-character short form.
    #[arg(long)]
    pub log_long_alloc: bool,

    /// Print without any prefix at all, as if there were exactly one task.
    #[arg(short = '1', long)]
    pub log_only_task: bool,

    /// Suppress every line prefix (group, task, and stream marker).
    #[arg(short = '0', long)]
    pub log_none: bool,
}

impl WatchArgs {
    /// Applies the `--follow` alias: `--all --lines 10` when neither `lines`
    /// nor `all` was already set more specifically.
    pub fn normalized(mut self) -> Self {
        if self.follow {
            self.all = true;
            self.lines.get_or_insert(10);
        }
        self
    }
}
