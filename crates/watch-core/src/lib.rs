#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Core engine for observing a scheduler job through to a terminal condition:
//! the event cache, the job watcher, per-task log streaming, and the
//! exit-code aggregation policy.

/// Public types shared across the client and the engine (records, events, config).
pub mod types;

/// Typed error conditions raised by the scheduler client and the cache.
pub mod error;

/// HTTP access to the scheduler: GETs, submit/stop, event-stream and log-stream follows.
pub mod client;

/// The event cache: subscribe/poll, dedupe by `(kind, id, ModifyIndex)`, publish batches.
pub mod cache;

/// Per-task state and per-allocation log following.
pub mod tasks;

/// Per-task log stream following: JSON framing, base64 decode, tail heuristic.
pub mod logstream;

/// Prefixed, colorized, optionally timestamped line output for the four stream kinds.
pub mod format;

/// The job-version filter and the two termination predicates.
pub mod watcher;

/// Blocks until a single evaluation leaves `pending`.
pub mod eval_wait;

/// The aggregate exit-code policy.
pub mod exitcode;

pub use cache::{CacheLookup, EventBatch, EventCache, InitFn, SelectFn};
pub use client::SchedulerClient;
pub use error::WatchError;
pub use eval_wait::{wait_for_evaluation, PlacementFailure};
pub use exitcode::{aggregate_exit_code, ExitCode, TaskOutcome};
pub use format::OutputFormatter;
pub use logstream::{spawn_log_streamer, LogStreamerHandle};
pub use tasks::{AllocationWorkers, TaskAction, TaskHandler, TaskKey};
pub use types::{
    Allocation, Deployment, Evaluation, Event, EventTopic, Job, ModifyIndex, Namespace, Options,
    StreamKind, TaskEvent, TaskState, TaskStatus,
};
pub use watcher::{JobWatcher, TerminationMode};
