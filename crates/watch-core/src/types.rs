//! The four entity kinds the scheduler emits, plus the event envelope and
//! the options record threaded into every component at construction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A server-assigned index, strictly increasing per identity, used to order
/// and deduplicate events.
pub type ModifyIndex = u64;

/// The scheduler's namespace string. `"*"` is rewritten to `"default"` by
/// the client before it ever reaches the cache.
pub type Namespace = String;

/// One task group's worth of lifecycle hook metadata, used by the
/// until-started predicate to pick out "main" tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// `"prestart"` | `"poststart"` | `"poststop"`.
    pub hook: LifecycleHook,
    /// Whether the task keeps running alongside the group's main tasks.
    pub sidecar: bool,
}

/// The hook phase a task's lifecycle block names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum LifecycleHook {
    /// Runs before the group's main tasks start.
    Prestart,
    /// Runs after the group's main tasks have started.
    Poststart,
    /// Runs after the group's main tasks have stopped.
    Poststop,
}

/// A single task definition within a task group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    /// Task name, unique within its group.
    pub name: String,
    /// Absent for ordinary main tasks.
    pub lifecycle: Option<Lifecycle>,
}

impl TaskDef {
    /// A task counts toward the until-started predicate's "every main task
    /// has started" check when it has no lifecycle block, is a sidecar
    /// prestart task, or is a poststart task.
    pub fn is_main_task(&self) -> bool {
        match &self.lifecycle {
            None => true,
            Some(Lifecycle { hook: LifecycleHook::Prestart, sidecar: true }) => true,
            Some(Lifecycle { hook: LifecycleHook::Poststart, .. }) => true,
            Some(_) => false,
        }
    }
}

/// A task group: a name and the tasks it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    /// Group name, unique within the job.
    pub name: String,
    /// Tasks belonging to this group.
    pub tasks: Vec<TaskDef>,
}

/// Coarse job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Not yet evaluated.
    Pending,
    /// Has at least one active allocation or evaluation.
    Running,
    /// Stopped (and, if purged, about to disappear from the scheduler entirely).
    Dead,
}

/// A job definition as registered with the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier, unique within a namespace.
    pub id: String,
    /// Namespace the job lives in.
    pub namespace: Namespace,
    /// Monotone version number, bumped on every registration.
    pub version: u64,
    /// Modify index of this version of the job.
    pub job_modify_index: ModifyIndex,
    /// Coarse lifecycle status.
    pub status: JobStatus,
    /// Task groups defined by this job version.
    pub task_groups: Vec<TaskGroup>,
}

/// Evaluation status as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    /// Not yet processed by the scheduler.
    Pending,
    /// Processed; placements (if any) were made.
    Complete,
    /// Waiting on a future evaluation (reschedule, deployment gate).
    Blocked,
    /// Could not be processed.
    Failed,
    /// Superseded before it ran.
    Canceled,
}

impl EvalStatus {
    /// Whether this status counts as "still active" for the until-finished predicate.
    pub fn is_pending(self) -> bool {
        matches!(self, EvalStatus::Pending)
    }
}

/// Per-group placement failure detail attached to a completed evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationMetric {
    /// Free-form description of why placement failed for this group.
    pub description: Option<String>,
}

/// A scheduler evaluation: one attempt at placing (or replacing) allocations
/// for a job version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// Evaluation identifier.
    pub id: String,
    /// Namespace the evaluation lives in.
    pub namespace: Namespace,
    /// Job this evaluation was raised for.
    pub job_id: String,
    /// Modify index of the job version this evaluation targets.
    pub job_modify_index: ModifyIndex,
    /// Modify index of this evaluation itself.
    pub modify_index: ModifyIndex,
    /// Current status.
    pub status: EvalStatus,
    /// Human-readable elaboration of `status`, surfaced on failure.
    pub status_description: String,
    /// Per-group placement failures, if any.
    pub failed_tg_allocs: HashMap<String, AllocationMetric>,
    /// Unix-epoch seconds at which a blocked evaluation is retried, if set.
    pub wait_until: Option<i64>,
}

/// Allocation client status as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    /// Placed but not yet running.
    Pending,
    /// At least one task is running.
    Running,
    /// All tasks exited zero.
    Complete,
    /// At least one task exited nonzero.
    Failed,
    /// The node hosting this allocation disappeared.
    Lost,
}

impl ClientStatus {
    /// Whether this status counts as "still active" for the until-finished predicate.
    pub fn is_active(self) -> bool {
        matches!(self, ClientStatus::Pending | ClientStatus::Running)
    }
}

/// Per-task runtime status inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Not started.
    Pending,
    /// Currently running.
    Running,
    /// Exited (successfully or not).
    Dead,
}

/// A single lifecycle event recorded against a task within an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Event type, e.g. `"Started"`, `"Terminated"`, `"Driver Failure"`.
    #[serde(rename = "Type")]
    pub kind: String,
    /// Nanosecond timestamp; also used to deduplicate repeated snapshots.
    #[serde(rename = "Time")]
    pub time: i64,
    /// Human-readable detail shown alongside the event type.
    #[serde(rename = "DisplayMessage", default)]
    pub display_message: String,
    /// Process exit code, present on `Terminated` events.
    #[serde(rename = "ExitCode")]
    pub exit_code: Option<i32>,
}

/// Current status and event history for one task within an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Current status of the task.
    pub state: TaskStatus,
    /// All events recorded so far for this task, oldest first.
    pub events: Vec<TaskEvent>,
}

impl TaskState {
    /// Whether a `Started` event has ever been recorded for this task.
    pub fn was_started(&self) -> bool {
        self.events.iter().any(|e| e.kind == "Started")
    }

    /// The exit code of the first `Terminated` event, if any.
    pub fn terminated_exit_code(&self) -> Option<i32> {
        self.events.iter().find(|e| e.kind == "Terminated").and_then(|e| e.exit_code)
    }
}

/// A placed instance of a task group on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation identifier.
    pub id: String,
    /// Namespace the allocation lives in.
    pub namespace: Namespace,
    /// Job this allocation belongs to.
    pub job_id: String,
    /// Job version this allocation was placed for.
    pub job_version: u64,
    /// Evaluation that created this allocation.
    pub eval_id: String,
    /// Evaluation created to reschedule this allocation, if any.
    pub followup_eval_id: Option<String>,
    /// Modify index of this allocation.
    pub modify_index: ModifyIndex,
    /// Node the allocation is placed on.
    pub node_name: String,
    /// Task group this allocation is an instance of.
    pub task_group: String,
    /// Aggregate client status.
    pub client_status: ClientStatus,
    /// Nanosecond creation time, used to pick the "most recent" allocation per group.
    pub create_time: i64,
    /// Nanosecond last-modified time.
    pub modify_time: i64,
    /// Per-task state, keyed by task name.
    pub task_states: HashMap<String, TaskState>,
}

/// Deployment status as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Being set up.
    Initializing,
    /// In progress.
    Running,
    /// Waiting on a blocking condition.
    Pending,
    /// Waiting on an upstream deployment.
    Blocked,
    /// Manually paused.
    Paused,
    /// Completed and promoted.
    Successful,
    /// Completed and rolled back.
    Failed,
    /// Superseded before it completed.
    Canceled,
}

impl DeploymentStatus {
    /// Whether this status counts as "still active" for the until-finished predicate.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Initializing
                | DeploymentStatus::Running
                | DeploymentStatus::Pending
                | DeploymentStatus::Blocked
                | DeploymentStatus::Paused
        )
    }
}

/// A rolling-update deployment for a job version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment identifier.
    pub id: String,
    /// Namespace the deployment lives in.
    pub namespace: Namespace,
    /// Job this deployment belongs to.
    pub job_id: String,
    /// Modify index of the job version this deployment targets.
    pub job_modify_index: ModifyIndex,
    /// Modify index of this deployment itself.
    pub modify_index: ModifyIndex,
    /// Current status.
    pub status: DeploymentStatus,
}

/// The scheduler's event-stream topics, used both to subscribe and to tag
/// incoming events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// Job registration/deregistration events.
    Job,
    /// Evaluation events.
    Evaluation,
    /// Allocation events.
    Allocation,
    /// Deployment events.
    Deployment,
}

impl EventTopic {
    /// The wire name used in `event/stream?topic=`.
    pub fn as_wire(self) -> &'static str {
        match self {
            EventTopic::Job => "Job",
            EventTopic::Evaluation => "Evaluation",
            EventTopic::Allocation => "Allocation",
            EventTopic::Deployment => "Deployment",
        }
    }
}

/// One entity-carrying event off the scheduler's event stream.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job was registered (or changed).
    JobRegistered(Job),
    /// A job was deregistered; only its identity and namespace matter.
    JobDeregistered {
        /// Job identifier.
        id: String,
        /// Namespace the job lived in.
        namespace: Namespace,
    },
    /// An evaluation was created or updated.
    Evaluation(Evaluation),
    /// An allocation was created or updated.
    Allocation(Allocation),
    /// A deployment was created or updated.
    Deployment(Deployment),
}

impl Event {
    /// The namespace this event is scoped to.
    pub fn namespace(&self) -> &str {
        match self {
            Event::JobRegistered(j) => &j.namespace,
            Event::JobDeregistered { namespace, .. } => namespace,
            Event::Evaluation(e) => &e.namespace,
            Event::Allocation(a) => &a.namespace,
            Event::Deployment(d) => &d.namespace,
        }
    }

    /// The `(kind-tag, identity)` pair the cache uses to dedupe and order.
    pub fn identity(&self) -> (&'static str, &str) {
        match self {
            Event::JobRegistered(j) => ("job", j.id.as_str()),
            Event::JobDeregistered { id, .. } => ("job", id.as_str()),
            Event::Evaluation(e) => ("eval", e.id.as_str()),
            Event::Allocation(a) => ("alloc", a.id.as_str()),
            Event::Deployment(d) => ("deploy", d.id.as_str()),
        }
    }

    /// The modify index carried by this event, used for the cache's
    /// monotonicity check. Deregistration events have no index of their
    /// own and are always accepted.
    pub fn modify_index(&self) -> Option<ModifyIndex> {
        match self {
            Event::JobRegistered(j) => Some(j.job_modify_index),
            Event::JobDeregistered { .. } => None,
            Event::Evaluation(e) => Some(e.modify_index),
            Event::Allocation(a) => Some(a.modify_index),
            Event::Deployment(d) => Some(d.modify_index),
        }
    }
}

/// Which of the four line kinds the output formatter may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Evaluation status lines.
    Eval,
    /// Allocation task-event lines.
    Alloc,
    /// Task stdout lines.
    Stdout,
    /// Task stderr lines.
    Stderr,
}

/// Immutable configuration threaded into every component at construction.
/// Replaces the ambient global options the original tool kept on a
/// process-wide namespace.
#[derive(Debug, Clone)]
pub struct Options {
    /// Scheduler base URL, e.g. `http://127.0.0.1:4646`.
    pub address: String,
    /// Namespace to operate in. `"*"` is normalized to `"default"` by the caller.
    pub namespace: Namespace,
    /// Bearer token attached to every request, if set.
    pub token: Option<String>,
    /// Disable the job-version filter; follow every version of the job.
    pub all_versions: bool,
    /// Which stream kinds the output formatter is allowed to emit.
    pub streams: Vec<StreamKind>,
    /// Stop the job when the watcher exits.
    pub attach: bool,
    /// Purge the job on stop.
    pub purge: bool,
    /// Only purge if the success classifier returns true.
    pub purge_successful: bool,
    /// Keep at most this many recent lines per task during the initial quiet window.
    pub lines: Option<usize>,
    /// Length of the initial quiet window, in seconds.
    pub lines_timeout: f64,
    /// Deadline for draining loggers on shutdown, in seconds.
    pub shutdown_timeout: f64,
    /// Stop after `shutdown_timeout` instead of waiting for the termination predicate.
    pub no_follow: bool,
    /// Restrict the task handler fan-out to tasks whose name matches this regex.
    pub task_filter: Option<regex::Regex>,
    /// Bypass the event stream; poll `init()` on a fixed cadence instead.
    pub polling: bool,
    /// Collapse the until-finished exit code to `0`/`2` instead of the full aggregate.
    pub no_preserve_status: bool,
    /// Prefix every line with its event/log timestamp, moved to the line's front.
    pub log_timestamp: bool,
    /// `chrono` format string used for `log_timestamp`; `None` uses the tool's default.
    pub log_timestamp_format: Option<String>,
    /// Omit the task-group name from line prefixes.
    pub log_no_group: bool,
    /// Omit the task name from line prefixes.
    pub log_no_task: bool,
    /// Print the full allocation id instead of its 6-character short form.
    pub log_long_alloc: bool,
    /// Reduce the line prefix to just the task name, as if there were exactly one task.
    pub log_only_task: bool,
    /// Suppress the identity prefix entirely; only the stream marker remains.
    pub log_none: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            address: "http://127.0.0.1:4646".to_string(),
            namespace: "default".to_string(),
            token: None,
            all_versions: false,
            streams: vec![StreamKind::Eval, StreamKind::Alloc, StreamKind::Stdout, StreamKind::Stderr],
            attach: false,
            purge: false,
            purge_successful: false,
            lines: Some(10),
            lines_timeout: 0.5,
            shutdown_timeout: 2.0,
            no_follow: false,
            task_filter: None,
            polling: false,
            no_preserve_status: false,
            log_timestamp: false,
            log_timestamp_format: None,
            log_no_group: false,
            log_no_task: false,
            log_long_alloc: false,
            log_only_task: false,
            log_none: false,
        }
    }
}
