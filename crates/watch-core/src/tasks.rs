//! Per-task state tracking and the allocation-wide worker map that owns it.
//!
//! `TaskHandler` is the pure, unit-testable half: given a `TaskState`
//! snapshot it decides which allocation events are new, whether loggers
//! should start, and when a task's exit code is known. `AllocationWorkers`
//! is the stateful half that keeps one `TaskHandler` per `(allocation,
//! task)` pair alive across however many allocation snapshots arrive,
//! mirroring how the teacher engine's `EngineRuntime` keeps one
//! `WorkerRuntime` alive per worker slot across however many jobs it runs.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::exitcode::TaskOutcome;
use crate::types::{Allocation, TaskEvent, TaskState, TaskStatus};

/// Identifies one task within one allocation, stable across task-state
/// snapshots and used as the routing key for printed log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    /// Allocation this task instance belongs to.
    pub alloc_id: String,
    /// Task group name.
    pub group: String,
    /// Task name within the group.
    pub task: String,
}

/// A side effect the driver must carry out in response to a new task-state
/// snapshot: emit an already-deduplicated allocation event, or change the
/// log streamers' lifecycle.
#[derive(Debug, Clone)]
pub enum TaskAction {
    /// A new (not previously emitted) allocation event for this task.
    EmitEvent(TaskEvent),
    /// The task has started; the driver should open its stdout/stderr followers.
    StartLoggers,
    /// The task reached `dead`; stop its followers after the given grace period.
    StopLoggersAfter(Duration),
}

/// Per-task dedup/lifecycle state. Pure aside from one wall-clock read used
/// only to size the dead-task grace period, never to make a decision.
#[derive(Debug)]
pub struct TaskHandler {
    key: TaskKey,
    printed_event_times: HashSet<i64>,
    loggers_started: bool,
    exit_code: Option<i32>,
    dead_since: Option<Instant>,
    emitted_count: usize,
}

impl TaskHandler {
    /// Creates a handler for a not-yet-observed task.
    pub fn new(key: TaskKey) -> Self {
        TaskHandler {
            key,
            printed_event_times: HashSet::new(),
            loggers_started: false,
            exit_code: None,
            dead_since: None,
            emitted_count: 0,
        }
    }

    /// The identity this handler tracks.
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Folds in one task-state snapshot, returning the actions the driver
    /// should take. `lines_cap` and `tail_threshold_ns` together implement
    /// the tail heuristic: an event timestamped at or after
    /// `tail_threshold_ns` (the quiet window's end) is always emitted; only
    /// earlier backlog events are subject to `lines_cap`, so a long-lived
    /// task's full history doesn't flood startup output but live events
    /// keep flowing forever once the window has passed.
    pub fn observe(
        &mut self,
        state: &TaskState,
        lines_cap: Option<usize>,
        tail_threshold_ns: Option<i64>,
    ) -> Vec<TaskAction> {
        let mut actions = Vec::new();

        for event in &state.events {
            if self.printed_event_times.contains(&event.time) {
                continue;
            }
            let past_quiet_window = tail_threshold_ns.is_none_or(|t| event.time >= t);
            let under_cap = lines_cap.is_none_or(|cap| self.emitted_count < cap);
            if !past_quiet_window && !under_cap {
                continue;
            }
            self.printed_event_times.insert(event.time);
            self.emitted_count += 1;
            actions.push(TaskAction::EmitEvent(event.clone()));
        }

        if !self.loggers_started
            && matches!(state.state, TaskStatus::Running | TaskStatus::Dead)
            && state.was_started()
        {
            self.loggers_started = true;
            actions.push(TaskAction::StartLoggers);
        }

        if state.state == TaskStatus::Dead {
            if self.exit_code.is_none() {
                self.exit_code = state.terminated_exit_code();
            }
            if self.dead_since.is_none() {
                self.dead_since = Some(Instant::now());
                actions.push(TaskAction::StopLoggersAfter(Duration::from_secs(3)));
            }
        }

        actions
    }

    /// This task's contribution to the exit-code aggregate: its exit code
    /// if `dead` and a `Terminated` event was observed, `None` otherwise
    /// (including "never reached `dead`" and "reached `dead` with no
    /// `Terminated` event", both of which count as unfinished).
    pub fn outcome(&self) -> TaskOutcome {
        if self.dead_since.is_some() {
            self.exit_code
        } else {
            None
        }
    }
}

/// Owns one `TaskHandler` per `(allocation, task)` pair seen across however
/// many allocation snapshots the job watcher forwards, and restricts the
/// fan-out to tasks matching an optional name filter.
#[derive(Debug, Default)]
pub struct AllocationWorkers {
    handlers: HashMap<TaskKey, TaskHandler>,
    task_filter: Option<regex::Regex>,
}

impl AllocationWorkers {
    /// Creates an empty worker map, optionally restricted to tasks whose
    /// name matches `task_filter`.
    pub fn new(task_filter: Option<regex::Regex>) -> Self {
        AllocationWorkers { handlers: HashMap::new(), task_filter }
    }

    /// Folds in one allocation snapshot, returning every task's actions
    /// keyed by its identity. `tail_threshold_ns` is forwarded to each
    /// task's handler; see [`TaskHandler::observe`].
    pub fn observe_allocation(
        &mut self,
        alloc: &Allocation,
        lines_cap: Option<usize>,
        tail_threshold_ns: Option<i64>,
    ) -> Vec<(TaskKey, TaskAction)> {
        let mut out = Vec::new();
        for (task_name, state) in &alloc.task_states {
            if let Some(filter) = &self.task_filter {
                if !filter.is_match(task_name) {
                    continue;
                }
            }
            let key = TaskKey {
                alloc_id: alloc.id.clone(),
                group: alloc.task_group.clone(),
                task: task_name.clone(),
            };
            let handler = self.handlers.entry(key.clone()).or_insert_with(|| TaskHandler::new(key.clone()));
            for action in handler.observe(state, lines_cap, tail_threshold_ns) {
                out.push((key.clone(), action));
            }
        }
        out
    }

    /// Every tracked task's contribution to the exit-code aggregate.
    pub fn outcomes(&self) -> Vec<TaskOutcome> {
        self.handlers.values().map(TaskHandler::outcome).collect()
    }

    /// Number of distinct tasks observed so far.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether any task has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskEvent as Evt;

    fn key() -> TaskKey {
        TaskKey { alloc_id: "a1".into(), group: "g".into(), task: "t".into() }
    }

    fn state(status: TaskStatus, events: Vec<Evt>) -> TaskState {
        TaskState { state: status, events }
    }

    fn ev(kind: &str, time: i64, exit_code: Option<i32>) -> Evt {
        Evt { kind: kind.to_string(), time, display_message: String::new(), exit_code }
    }

    #[test]
    fn repeated_snapshot_emits_each_event_once() {
        let mut h = TaskHandler::new(key());
        let events = vec![ev("Started", 1, None)];
        let actions1 = h.observe(&state(TaskStatus::Running, events.clone()), None, None);
        assert_eq!(actions1.len(), 2); // EmitEvent + StartLoggers
        let actions2 = h.observe(&state(TaskStatus::Running, events), None, None);
        assert!(actions2.is_empty(), "identical snapshot must not re-emit");
    }

    #[test]
    fn loggers_start_exactly_once_after_started_event() {
        let mut h = TaskHandler::new(key());
        let events = vec![ev("Started", 1, None)];
        h.observe(&state(TaskStatus::Running, events.clone()), None, None);
        let actions = h.observe(&state(TaskStatus::Running, events), None, None);
        assert!(actions.is_empty());
    }

    #[test]
    fn dead_without_terminated_event_is_unfinished() {
        let mut h = TaskHandler::new(key());
        h.observe(&state(TaskStatus::Dead, vec![ev("Started", 1, None)]), None, None);
        assert_eq!(h.outcome(), None);
    }

    #[test]
    fn dead_with_terminated_event_captures_exit_code() {
        let mut h = TaskHandler::new(key());
        h.observe(
            &state(TaskStatus::Dead, vec![ev("Started", 1, None), ev("Terminated", 2, Some(7))]),
            None,
            None,
        );
        assert_eq!(h.outcome(), Some(7));
    }

    #[test]
    fn lines_cap_bounds_backlog_events_with_no_threshold_set() {
        let mut h = TaskHandler::new(key());
        let events = vec![ev("Started", 1, None), ev("A", 2, None), ev("B", 3, None)];
        let actions = h.observe(&state(TaskStatus::Running, events), Some(1), None);
        let emitted = actions.iter().filter(|a| matches!(a, TaskAction::EmitEvent(_))).count();
        assert_eq!(emitted, 1);
    }

    #[test]
    fn events_past_the_quiet_window_bypass_the_cap() {
        let mut h = TaskHandler::new(key());
        // Backlog: three events before the threshold, cap is 1.
        let backlog = vec![ev("Started", 1, None), ev("A", 2, None), ev("B", 3, None)];
        let actions = h.observe(&state(TaskStatus::Running, backlog), Some(1), Some(10));
        let emitted = actions.iter().filter(|a| matches!(a, TaskAction::EmitEvent(_))).count();
        assert_eq!(emitted, 1, "only the under-cap backlog events emit before the threshold");

        // Live events at/after the threshold must always emit, cap notwithstanding.
        let live = vec![ev("Started", 1, None), ev("A", 2, None), ev("B", 3, None), ev("C", 10, None), ev("D", 11, None)];
        let actions = h.observe(&state(TaskStatus::Running, live), Some(1), Some(10));
        let emitted: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                TaskAction::EmitEvent(e) => Some(e.time),
                _ => None,
            })
            .collect();
        assert_eq!(emitted, vec![10, 11], "live events past the threshold are never suppressed by the cap");
    }

    #[test]
    fn task_filter_excludes_non_matching_tasks() {
        use std::collections::HashMap as Map;
        let mut workers = AllocationWorkers::new(Some(regex::Regex::new("^main$").unwrap()));
        let mut states = Map::new();
        states.insert("main".to_string(), state(TaskStatus::Running, vec![ev("Started", 1, None)]));
        states.insert("sidecar".to_string(), state(TaskStatus::Running, vec![ev("Started", 1, None)]));
        let alloc = Allocation {
            id: "a1".into(),
            namespace: "default".into(),
            job_id: "j1".into(),
            job_version: 0,
            eval_id: "e1".into(),
            followup_eval_id: None,
            modify_index: 1,
            node_name: "n1".into(),
            task_group: "g".into(),
            client_status: crate::types::ClientStatus::Running,
            create_time: 0,
            modify_time: 0,
            task_states: states,
        };
        workers.observe_allocation(&alloc, None, None);
        assert_eq!(workers.len(), 1);
    }
}
