//! The `nomad-watch` binary: parses the command line, wires a scheduler
//! client and a job (or allocation) watcher together, and drives the
//! watch loop to the caller's chosen terminal condition.
//!
//! The loop itself follows the teacher engine's `run_engine` shape: one
//! `tokio::select!` over a ctrl-c channel, a periodic ticker, the log-line
//! channel, and the next batch of admitted events, repeated until a
//! termination predicate or a shutdown signal ends it.

mod cli;
mod shutdown;

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::Instant;

use nomad_watch_core::{
    aggregate_exit_code, spawn_log_streamer, wait_for_evaluation, AllocationWorkers, CacheLookup,
    Event, EventCache, EventTopic, ExitCode, InitFn, JobWatcher, LogStreamerHandle, Options,
    OutputFormatter, SchedulerClient, SelectFn, TaskAction, TaskKey, TerminationMode,
};
use nomad_watch_support::{load_job_spec, JobPath};

use crate::cli::{AllocArgs, Cli, Command, JobArgs, OutSelect, RunArgs, WatchArgs};
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

/// The four global flags every subcommand shares, pulled out of `Cli`
/// before `Cli::command` is consumed by the dispatch match.
struct GlobalOpts {
    address: String,
    namespace: String,
    token: Option<String>,
    polling: bool,
}

/// How the watch loop ended, independent of why the caller wanted to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverExit {
    /// The termination predicate was satisfied.
    Reached,
    /// A single ctrl-c (or a `--no-follow` deadline) asked for a graceful stop.
    Interrupted,
    /// A second ctrl-c asked for an immediate exit, skipping the drain.
    Immediate,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn build_options(global: &GlobalOpts, watch: &WatchArgs) -> Options {
    let watch = watch.clone().normalized();
    Options {
        address: global.address.clone(),
        namespace: global.namespace.clone(),
        token: global.token.clone(),
        all_versions: watch.all,
        streams: OutSelect::resolve(&watch.out),
        attach: watch.attach,
        purge: watch.purge,
        purge_successful: watch.purge_successful,
        lines: watch.lines,
        lines_timeout: watch.lines_timeout,
        shutdown_timeout: watch.shutdown_timeout,
        no_follow: watch.no_follow,
        task_filter: watch.task.clone(),
        polling: global.polling,
        no_preserve_status: watch.no_preserve_status,
        log_timestamp: watch.log_timestamp,
        log_timestamp_format: watch.log_timestamp_format.clone(),
        log_no_group: watch.log_no_group,
        log_no_task: watch.log_no_task,
        log_long_alloc: watch.log_long_alloc,
        log_only_task: watch.log_only_task,
        log_none: watch.log_none,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    let code = match run(cli, &mut shutdown_rx).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "watch failed");
            eprintln!("nomad-watch: {err:#}");
            ExitCode::Exception.code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli, shutdown_rx: &mut mpsc::UnboundedReceiver<ShutdownEvent>) -> anyhow::Result<i32> {
    let global = GlobalOpts { address: cli.address, namespace: cli.namespace, token: cli.token, polling: cli.polling };
    match cli.command {
        Command::Run(args) => run_submit_and_watch(&global, args, TerminationMode::UntilFinished, shutdown_rx).await,
        Command::Start(args) => run_submit_and_watch(&global, args, TerminationMode::UntilStarted, shutdown_rx).await,
        Command::Job(args) => watch_existing(&global, args, TerminationMode::UntilFinished, false, shutdown_rx).await,
        Command::Started(args) => watch_existing(&global, args, TerminationMode::UntilStarted, false, shutdown_rx).await,
        Command::Stop(args) => watch_existing(&global, args, TerminationMode::UntilFinished, true, shutdown_rx).await,
        Command::Stopped(args) => watch_existing(&global, args, TerminationMode::UntilFinished, false, shutdown_rx).await,
        Command::Alloc(args) => watch_alloc(&global, args, shutdown_rx).await,
    }
}

async fn run_submit_and_watch(
    global: &GlobalOpts,
    args: RunArgs,
    mode: TerminationMode,
    shutdown_rx: &mut mpsc::UnboundedReceiver<ShutdownEvent>,
) -> anyhow::Result<i32> {
    let options = build_options(global, &args.watch);
    let color = std::io::stdout().is_terminal();
    let formatter = OutputFormatter::new(&options, color);
    let client = SchedulerClient::new(global.address.clone(), global.namespace.clone(), global.token.clone())?;

    let job_spec = load_job_spec(&args.jobfile, args.json)?;
    let eval_id = client
        .submit_job(job_spec)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job submission returned no evaluation id"))?;

    tracing::info!(%eval_id, "submitted job, waiting for evaluation");
    let (eval, failures) = wait_for_evaluation(client.clone(), eval_id, options.polling).await?;
    for failure in &failures {
        formatter.print_eval(&eval.id, &format!("{}: {}", failure.group, failure.description));
    }

    watch_job(&client, &eval.job_id, &formatter, &options, mode, false, shutdown_rx).await
}

async fn watch_existing(
    global: &GlobalOpts,
    args: JobArgs,
    mode: TerminationMode,
    stop_before_watch: bool,
    shutdown_rx: &mut mpsc::UnboundedReceiver<ShutdownEvent>,
) -> anyhow::Result<i32> {
    let path = JobPath::parse(&args.job).map_err(|e| anyhow::anyhow!(e))?;
    let mut watch = args.watch;
    if watch.task.is_none() {
        if let Some(pattern) = path.task_pattern() {
            watch.task = Some(regex::Regex::new(&pattern)?);
        }
    }
    let options = build_options(global, &watch);
    let color = std::io::stdout().is_terminal();
    let formatter = OutputFormatter::new(&options, color);
    let client = SchedulerClient::new(global.address.clone(), global.namespace.clone(), global.token.clone())?;

    watch_job(&client, &path.job_id, &formatter, &options, mode, stop_before_watch, shutdown_rx).await
}

async fn watch_job(
    client: &SchedulerClient,
    job_id: &str,
    formatter: &OutputFormatter,
    options: &Options,
    mode: TerminationMode,
    stop_before_watch: bool,
    shutdown_rx: &mut mpsc::UnboundedReceiver<ShutdownEvent>,
) -> anyhow::Result<i32> {
    let watcher = JobWatcher::start(client.clone(), job_id.to_string(), options.all_versions, options.polling).await?;

    if stop_before_watch {
        watcher.stop_job(options.purge).await?;
    }

    let mut workers = AllocationWorkers::new(options.task_filter.clone());
    let exit = run_job_loop(&watcher, client, formatter, &mut workers, mode, options, shutdown_rx).await?;

    if exit == DriverExit::Immediate {
        watcher.stop();
        std::process::exit(ExitCode::Interrupted.code());
    }

    if !stop_before_watch {
        finalize_stop(&watcher, options, mode).await?;
    } else if options.purge_successful {
        maybe_purge_successful(&watcher, mode).await?;
    }

    watcher.join().await;

    let exit_code = match mode {
        TerminationMode::UntilFinished => {
            if exit != DriverExit::Reached {
                ExitCode::Interrupted
            } else if options.no_preserve_status {
                ExitCode::Success
            } else {
                aggregate_exit_code(&workers.outcomes())
            }
        }
        TerminationMode::UntilStarted => {
            if exit == DriverExit::Reached { ExitCode::Success } else { ExitCode::Interrupted }
        }
    };

    tracing::info!(job = %job_id, exit_code = exit_code.code(), "watch finished");
    Ok(exit_code.code())
}

/// Applies `--attach`/`--purge`/`--purge-successful` once the watch has
/// ended, unless the caller already issued the stop before watching
/// (the `stop`/`stopped` subcommands).
async fn finalize_stop(watcher: &JobWatcher, options: &Options, mode: TerminationMode) -> anyhow::Result<()> {
    if options.purge_successful {
        maybe_purge_successful(watcher, mode).await
    } else if options.purge {
        watcher.stop_job(true).await.map_err(Into::into)
    } else if options.attach {
        watcher.stop_job(false).await.map_err(Into::into)
    } else {
        Ok(())
    }
}

async fn maybe_purge_successful(watcher: &JobWatcher, mode: TerminationMode) -> anyhow::Result<()> {
    let success = match mode {
        TerminationMode::UntilFinished => watcher.job_finished_successfully().await?,
        TerminationMode::UntilStarted => watcher.job_running_successfully().await?,
    };
    if success {
        watcher.stop_job(true).await?;
    }
    Ok(())
}

async fn watch_alloc(
    global: &GlobalOpts,
    args: AllocArgs,
    shutdown_rx: &mut mpsc::UnboundedReceiver<ShutdownEvent>,
) -> anyhow::Result<i32> {
    let lookup_client = SchedulerClient::new(global.address.clone(), global.namespace.clone(), global.token.clone())?;
    let matches = lookup_client.find_allocations_by_prefix(&args.allocid).await?;
    let (alloc_id, namespace) = match matches.len() {
        0 => anyhow::bail!("no allocation found matching id {}", args.allocid),
        1 => matches.into_iter().next().unwrap(),
        _ => anyhow::bail!("allocation id {} is ambiguous; matches multiple allocations", args.allocid),
    };

    let options = build_options(global, &args.watch);
    let color = std::io::stdout().is_terminal();
    let formatter = OutputFormatter::new(&options, color);
    let client = SchedulerClient::new(global.address.clone(), namespace, global.token.clone())?;

    let select: SelectFn = {
        let alloc_id = alloc_id.clone();
        Arc::new(move |event: &Event, _lookup: &dyn CacheLookup| {
            matches!(event, Event::Allocation(a) if a.id == alloc_id)
        })
    };
    let init: InitFn = {
        let client = client.clone();
        let alloc_id = alloc_id.clone();
        Arc::new(move || {
            let client = client.clone();
            let alloc_id = alloc_id.clone();
            Box::pin(async move { Ok(vec![Event::Allocation(client.get_allocation(&alloc_id).await?)]) })
        })
    };

    let namespace = client.namespace().to_string();
    let cache =
        EventCache::start(client.clone(), namespace, vec![EventTopic::Allocation], select, init, options.polling)
            .await?;

    let mut workers = AllocationWorkers::new(options.task_filter.clone());
    let exit = run_alloc_loop(&cache, &client, &formatter, &mut workers, &options, shutdown_rx).await?;

    if exit == DriverExit::Immediate {
        cache.stop();
        std::process::exit(ExitCode::Interrupted.code());
    }

    cache.stop();
    cache.join().await;

    let exit_code = if exit == DriverExit::Reached { aggregate_exit_code(&workers.outcomes()) } else { ExitCode::Interrupted };
    tracing::info!(alloc = %alloc_id, exit_code = exit_code.code(), "allocation watch finished");
    Ok(exit_code.code())
}

/// Active log followers for one task. Dropping this struct does not stop
/// the followers; call `stop()` explicitly.
struct TaskLoggers {
    stdout: LogStreamerHandle,
    stderr: LogStreamerHandle,
}

impl TaskLoggers {
    fn stop(&self) {
        self.stdout.stop();
        self.stderr.stop();
    }

    async fn join(self) {
        self.stdout.join().await;
        self.stderr.join().await;
    }
}

fn start_loggers(
    client: &SchedulerClient,
    key: &TaskKey,
    quiet_window: Duration,
    lines_cap: Option<usize>,
    tail: bool,
    line_tx: &mpsc::UnboundedSender<(TaskKey, bool, String)>,
) -> TaskLoggers {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<String>();

    let stdout =
        spawn_log_streamer(client.clone(), key.alloc_id.clone(), key.task.clone(), "stdout", tail, quiet_window, lines_cap, out_tx);
    let stderr =
        spawn_log_streamer(client.clone(), key.alloc_id.clone(), key.task.clone(), "stderr", tail, quiet_window, lines_cap, err_tx);

    {
        let key = key.clone();
        let line_tx = line_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if line_tx.send((key.clone(), false, line)).is_err() {
                    break;
                }
            }
        });
    }
    {
        let key = key.clone();
        let line_tx = line_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = err_rx.recv().await {
                if line_tx.send((key.clone(), true, line)).is_err() {
                    break;
                }
            }
        });
    }

    TaskLoggers { stdout, stderr }
}

/// Applies one allocation snapshot's task actions: prints already-deduped
/// events, starts a task's loggers, or schedules them to stop after the
/// grace period the task handler computed.
#[allow(clippy::too_many_arguments)]
fn apply_task_actions(
    actions: Vec<(TaskKey, TaskAction)>,
    client: &SchedulerClient,
    formatter: &OutputFormatter,
    quiet_window: Duration,
    lines_cap: Option<usize>,
    tail: bool,
    line_tx: &mpsc::UnboundedSender<(TaskKey, bool, String)>,
    loggers: &mut HashMap<TaskKey, TaskLoggers>,
    stop_at: &mut HashMap<TaskKey, Instant>,
) {
    for (key, action) in actions {
        match action {
            TaskAction::EmitEvent(event) => {
                formatter.print_alloc(&key, event.time, &event.kind, &event.display_message);
            }
            TaskAction::StartLoggers => {
                let handles = start_loggers(client, &key, quiet_window, lines_cap, tail, line_tx);
                loggers.insert(key, handles);
            }
            TaskAction::StopLoggersAfter(grace) => {
                stop_at.insert(key, Instant::now() + grace);
            }
        }
    }
}

/// The wall-clock nanosecond timestamp at which the initial quiet window
/// ends, used to decide which allocation events count as "backlog" (subject
/// to `--lines`) versus "live" (always emitted). `None` outside tail mode.
fn tail_threshold_ns(tail: bool, lines_timeout: f64) -> Option<i64> {
    if !tail {
        return None;
    }
    let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64;
    Some(now_ns + (lines_timeout * 1_000_000_000.0) as i64)
}

async fn drain_loggers(loggers: HashMap<TaskKey, TaskLoggers>, deadline: Duration) {
    let drain = async {
        for (_, loggers) in loggers {
            loggers.stop();
            loggers.join().await;
        }
    };
    let _ = tokio::time::timeout(deadline, drain).await;
}

/// Drives a `JobWatcher` until its termination predicate is satisfied or a
/// shutdown signal interrupts it, fanning out allocation events into
/// printed lines and per-task log followers as it goes.
async fn run_job_loop(
    watcher: &JobWatcher,
    client: &SchedulerClient,
    formatter: &OutputFormatter,
    workers: &mut AllocationWorkers,
    mode: TerminationMode,
    options: &Options,
    shutdown_rx: &mut mpsc::UnboundedReceiver<ShutdownEvent>,
) -> anyhow::Result<DriverExit> {
    let quiet_window = Duration::from_secs_f64(options.lines_timeout);
    let tail = options.lines.is_some();
    let tail_threshold = tail_threshold_ns(tail, options.lines_timeout);
    let mut loggers: HashMap<TaskKey, TaskLoggers> = HashMap::new();
    let mut stop_at: HashMap<TaskKey, Instant> = HashMap::new();
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(TaskKey, bool, String)>();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    let body = async {
        loop {
            tokio::select! {
                ev = shutdown_rx.recv() => {
                    match ev {
                        Some(ShutdownEvent::Graceful) | None => return Ok(DriverExit::Interrupted),
                        Some(ShutdownEvent::Immediate) => return Ok(DriverExit::Immediate),
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let due: Vec<TaskKey> = stop_at.iter().filter(|(_, &at)| now >= at).map(|(k, _)| k.clone()).collect();
                    for key in due {
                        stop_at.remove(&key);
                        if let Some(handles) = loggers.get(&key) {
                            handles.stop();
                        }
                    }
                }
                Some((key, is_err, line)) = line_rx.recv() => {
                    if is_err { formatter.print_stderr(&key, &line); } else { formatter.print_stdout(&key, &line); }
                }
                batch = watcher.next_batch() => {
                    let Some(batch) = batch else { return Ok(DriverExit::Reached) };
                    let batch = batch?;
                    watcher.observe_batch(&batch);
                    for event in &batch.events {
                        match event {
                            Event::Evaluation(eval) => {
                                for (group, metric) in &eval.failed_tg_allocs {
                                    if let Some(desc) = &metric.description {
                                        formatter.print_eval(&eval.id, &format!("{group}: {desc}"));
                                    }
                                }
                            }
                            Event::Allocation(alloc) => {
                                let actions = workers.observe_allocation(alloc, options.lines, tail_threshold);
                                apply_task_actions(actions, client, formatter, quiet_window, options.lines, tail, &line_tx, &mut loggers, &mut stop_at);
                            }
                            _ => {}
                        }
                    }
                    let done = match mode {
                        TerminationMode::UntilFinished => watcher.is_finished().await,
                        TerminationMode::UntilStarted => {
                            if watcher.is_started().await {
                                true
                            } else if watcher.should_bail_before_started().await {
                                return Ok(DriverExit::Interrupted);
                            } else {
                                false
                            }
                        }
                    };
                    if done {
                        return Ok(DriverExit::Reached);
                    }
                }
            }
        }
    };

    let exit: anyhow::Result<DriverExit> = if options.no_follow {
        match tokio::time::timeout(Duration::from_secs_f64(options.shutdown_timeout), body).await {
            Ok(result) => result,
            Err(_) => Ok(DriverExit::Interrupted),
        }
    } else {
        body.await
    };

    watcher.stop();
    drain_loggers(loggers, Duration::from_secs_f64(options.shutdown_timeout)).await;
    exit
}

/// Drives a single allocation's task loggers until every client status the
/// cache has observed is terminal, mirroring `run_job_loop` but sourced
/// directly from an `EventCache` scoped to one allocation.
async fn run_alloc_loop(
    cache: &EventCache,
    client: &SchedulerClient,
    formatter: &OutputFormatter,
    workers: &mut AllocationWorkers,
    options: &Options,
    shutdown_rx: &mut mpsc::UnboundedReceiver<ShutdownEvent>,
) -> anyhow::Result<DriverExit> {
    let quiet_window = Duration::from_secs_f64(options.lines_timeout);
    let tail = options.lines.is_some();
    let tail_threshold = tail_threshold_ns(tail, options.lines_timeout);
    let mut loggers: HashMap<TaskKey, TaskLoggers> = HashMap::new();
    let mut stop_at: HashMap<TaskKey, Instant> = HashMap::new();
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(TaskKey, bool, String)>();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    let body = async {
        loop {
            tokio::select! {
                ev = shutdown_rx.recv() => {
                    match ev {
                        Some(ShutdownEvent::Graceful) | None => return Ok(DriverExit::Interrupted),
                        Some(ShutdownEvent::Immediate) => return Ok(DriverExit::Immediate),
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let due: Vec<TaskKey> = stop_at.iter().filter(|(_, &at)| now >= at).map(|(k, _)| k.clone()).collect();
                    for key in due {
                        stop_at.remove(&key);
                        if let Some(handles) = loggers.get(&key) {
                            handles.stop();
                        }
                    }
                }
                Some((key, is_err, line)) = line_rx.recv() => {
                    if is_err { formatter.print_stderr(&key, &line); } else { formatter.print_stdout(&key, &line); }
                }
                batch = cache.next_batch() => {
                    let Some(batch) = batch else { return Ok(DriverExit::Reached) };
                    let batch = batch?;
                    let mut finished = false;
                    for event in &batch.events {
                        if let Event::Allocation(alloc) = event {
                            let actions = workers.observe_allocation(alloc, options.lines, tail_threshold);
                            apply_task_actions(actions, client, formatter, quiet_window, options.lines, tail, &line_tx, &mut loggers, &mut stop_at);
                            if !alloc.client_status.is_active() {
                                finished = true;
                            }
                        }
                    }
                    if finished {
                        return Ok(DriverExit::Reached);
                    }
                }
            }
        }
    };

    let exit: anyhow::Result<DriverExit> = if options.no_follow {
        match tokio::time::timeout(Duration::from_secs_f64(options.shutdown_timeout), body).await {
            Ok(result) => result,
            Err(_) => Ok(DriverExit::Interrupted),
        }
    } else {
        body.await
    };

    drain_loggers(loggers, Duration::from_secs_f64(options.shutdown_timeout)).await;
    exit
}
