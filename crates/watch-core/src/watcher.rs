//! The job-version filter and the two termination predicates (until
//! finished, until started) that together define "has this job reached the
//! condition the caller asked to wait for".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{CacheLookup, EventBatch, EventCache, InitFn, SelectFn};
use crate::client::SchedulerClient;
use crate::error::WatchError;
use crate::types::{Allocation, Deployment, Event, EventTopic, Evaluation, Job, JobStatus};

/// Which terminal condition a job watcher is driving toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Wait until the job (and every allocation/evaluation/deployment it
    /// spawned) has no active work left and the job itself is dead or purged.
    UntilFinished,
    /// Wait until every task group has a started allocation for the watched
    /// job version.
    UntilStarted,
}

/// Subscribes to a single job's four entity-kind streams, filtered to one
/// job version (unless `--all` is set), and evaluates the termination
/// predicates against the resulting cache.
pub struct JobWatcher {
    client: SchedulerClient,
    cache: EventCache,
    job_id: String,
    watched_version: u64,
    all_versions: bool,
    purge_requested: Arc<AtomicBool>,
    ever_seen_job: Arc<AtomicBool>,
}

impl JobWatcher {
    /// Starts watching `job_id`. If the job is already registered, its
    /// current version/modify-index become the watched version; if it does
    /// not exist yet (the caller is about to submit it), the filter admits
    /// the first version it ever sees.
    pub async fn start(
        client: SchedulerClient,
        job_id: String,
        all_versions: bool,
        polling: bool,
    ) -> Result<Self, WatchError> {
        let seed = match client.get_job(&job_id).await {
            Ok(job) => Some(job),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let watched_version = seed.as_ref().map(|j| j.version).unwrap_or(0);
        let watched_modify_index = seed.as_ref().map(|j| j.job_modify_index).unwrap_or(0);
        let ever_seen_job = Arc::new(AtomicBool::new(seed.is_some()));
        let purge_requested = Arc::new(AtomicBool::new(false));

        let select: SelectFn = {
            let job_id = job_id.clone();
            Arc::new(move |event: &Event, lookup: &dyn CacheLookup| {
                if all_versions {
                    return event_belongs_to_job(event, &job_id);
                }
                match event {
                    Event::JobRegistered(j) => j.id == job_id,
                    Event::JobDeregistered { id, .. } => id == &job_id,
                    Event::Evaluation(e) => e.job_id == job_id && e.job_modify_index >= watched_modify_index,
                    Event::Allocation(a) => {
                        a.job_id == job_id
                            && (a.job_version >= watched_version
                                || lookup
                                    .evaluation(&a.eval_id)
                                    .is_some_and(|e| e.job_modify_index >= watched_modify_index))
                    }
                    Event::Deployment(d) => d.job_id == job_id && d.job_modify_index >= watched_modify_index,
                }
            })
        };

        let init: InitFn = {
            let client = client.clone();
            let job_id = job_id.clone();
            let purge_requested = Arc::clone(&purge_requested);
            Arc::new(move || {
                let client = client.clone();
                let job_id = job_id.clone();
                let tolerate_missing = purge_requested.load(Ordering::SeqCst);
                Box::pin(async move { client.init_snapshot(&job_id, tolerate_missing).await })
            })
        };

        let namespace = client_namespace(&client);
        let cache = EventCache::start(
            client.clone(),
            namespace,
            vec![EventTopic::Job, EventTopic::Evaluation, EventTopic::Allocation, EventTopic::Deployment],
            select,
            init,
            polling,
        )
        .await?;

        Ok(JobWatcher {
            client,
            cache,
            job_id,
            watched_version,
            all_versions,
            purge_requested,
            ever_seen_job,
        })
    }

    /// Awaits the next batch of admitted events.
    pub async fn next_batch(&self) -> Option<Result<EventBatch, WatchError>> {
        self.cache.next_batch().await
    }

    /// Updates internal bookkeeping (has a Job record ever been observed)
    /// from a batch the driver just received. Must be called for every
    /// batch before re-checking the termination predicates.
    pub fn observe_batch(&self, batch: &EventBatch) {
        for event in &batch.events {
            if let Event::JobRegistered(job) = event {
                if job.id == self.job_id {
                    self.ever_seen_job.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Issues a stop (optionally purge) request. Safe to call multiple
    /// times and after termination has already been observed.
    pub async fn stop_job(&self, purge: bool) -> Result<(), WatchError> {
        if purge {
            self.purge_requested.store(true, Ordering::SeqCst);
        }
        self.client.stop_job(&self.job_id, purge).await
    }

    /// Stops the underlying cache's background task.
    pub fn stop(&self) {
        self.cache.stop();
    }

    /// Joins the cache's background task after `stop()`.
    pub async fn join(self) {
        self.cache.join().await;
    }

    /// Evaluates the until-finished predicate against the current cache contents.
    pub async fn is_finished(&self) -> bool {
        if !self.ever_seen_job.load(Ordering::SeqCst) {
            return false;
        }
        let job = self.cache.job().await;
        let allocs = self.cache.allocations().await;
        let evals = self.cache.evaluations().await;
        let deploys = self.cache.deployments().await;
        until_finished_predicate(job.as_ref(), &allocs, &evals, &deploys, self.purge_requested.load(Ordering::SeqCst))
    }

    /// Evaluates the until-started predicate against the current cache
    /// contents. Returns `false` if the job record has not been seen yet.
    pub async fn is_started(&self) -> bool {
        let Some(job) = self.cache.job().await else { return false };
        let allocs = self.cache.allocations().await;
        until_started_predicate(&job, &allocs, self.watched_version, self.all_versions)
    }

    /// True if the job died (or was purged) with no active work and the
    /// until-started condition was never satisfied; the caller should stop
    /// with the `interrupted` exit code in that case.
    pub async fn should_bail_before_started(&self) -> bool {
        if self.is_started().await {
            return false;
        }
        let no_active = {
            let allocs = self.cache.allocations().await;
            let evals = self.cache.evaluations().await;
            let deploys = self.cache.deployments().await;
            allocs.iter().all(|a| !a.client_status.is_active())
                && evals.iter().all(|e| !e.status.is_pending())
                && deploys.iter().all(|d| !d.status.is_active())
        };
        match self.cache.job().await {
            Some(job) => no_active && job.status == JobStatus::Dead,
            None => no_active && self.ever_seen_job.load(Ordering::SeqCst) && self.purge_requested.load(Ordering::SeqCst),
        }
    }

    /// Consults `job/{id}/summary` to decide whether the job finished with
    /// no queued/failed/starting/lost allocations and at least one complete.
    pub async fn job_finished_successfully(&self) -> Result<bool, WatchError> {
        Ok(self.client.job_summary(&self.job_id).await?.finished_successfully())
    }

    /// Consults `job/{id}/summary` to decide whether the job is running
    /// with no queued/failed/starting/lost allocations and at least one running.
    pub async fn job_running_successfully(&self) -> Result<bool, WatchError> {
        Ok(self.client.job_summary(&self.job_id).await?.running_successfully())
    }
}

fn event_belongs_to_job(event: &Event, job_id: &str) -> bool {
    match event {
        Event::JobRegistered(j) => j.id == job_id,
        Event::JobDeregistered { id, .. } => id == job_id,
        Event::Evaluation(e) => e.job_id == job_id,
        Event::Allocation(a) => a.job_id == job_id,
        Event::Deployment(d) => d.job_id == job_id,
    }
}

fn client_namespace(client: &SchedulerClient) -> String {
    // SchedulerClient is constructed with a normalized namespace; watchers
    // reuse it rather than threading a second copy through every caller.
    client.namespace().to_string()
}

/// Pure until-finished check: no active allocations, evaluations, or
/// deployments remain, and the job itself is dead (or was cleared by a
/// purge that was requested).
pub fn until_finished_predicate(
    job: Option<&Job>,
    allocs: &[Allocation],
    evals: &[Evaluation],
    deploys: &[Deployment],
    purge_requested: bool,
) -> bool {
    let no_active_allocs = allocs.iter().all(|a| !a.client_status.is_active());
    let no_active_evals = evals.iter().all(|e| !e.status.is_pending());
    let no_active_deploys = deploys.iter().all(|d| !d.status.is_active());
    if !(no_active_allocs && no_active_evals && no_active_deploys) {
        return false;
    }
    match job {
        Some(job) => job.status == JobStatus::Dead,
        None => purge_requested,
    }
}

/// Pure until-started check: every task group has a most-recently-modified
/// allocation (for the watched version) whose main tasks have all started.
pub fn until_started_predicate(
    job: &Job,
    allocs: &[Allocation],
    watched_version: u64,
    all_versions: bool,
) -> bool {
    job.task_groups.iter().all(|group| {
        let mut group_allocs: Vec<&Allocation> = allocs
            .iter()
            .filter(|a| a.task_group == group.name && (all_versions || a.job_version >= watched_version))
            .collect();
        group_allocs.sort_by_key(|a| a.modify_time);
        let Some(latest) = group_allocs.last() else { return false };
        group.tasks.iter().filter(|t| t.is_main_task()).all(|t| {
            latest.task_states.get(&t.name).is_some_and(|s| s.was_started())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientStatus, EvalStatus, JobStatus, Lifecycle, LifecycleHook, TaskDef, TaskEvent, TaskGroup, TaskState, TaskStatus};
    use std::collections::HashMap;

    fn job(status: JobStatus) -> Job {
        Job { id: "j1".into(), namespace: "default".into(), version: 1, job_modify_index: 10, status, task_groups: vec![] }
    }

    #[test]
    fn finished_false_with_no_job_and_no_purge() {
        assert!(!until_finished_predicate(None, &[], &[], &[], false));
    }

    #[test]
    fn finished_true_when_purged_and_cleared() {
        assert!(until_finished_predicate(None, &[], &[], &[], true));
    }

    #[test]
    fn finished_true_when_job_dead_and_nothing_active() {
        assert!(until_finished_predicate(Some(&job(JobStatus::Dead)), &[], &[], &[], false));
    }

    #[test]
    fn finished_false_while_an_evaluation_is_pending() {
        let eval = Evaluation {
            id: "e1".into(), namespace: "default".into(), job_id: "j1".into(), job_modify_index: 10,
            modify_index: 1, status: EvalStatus::Pending, status_description: String::new(),
            failed_tg_allocs: HashMap::new(), wait_until: None,
        };
        assert!(!until_finished_predicate(Some(&job(JobStatus::Dead)), &[], &[eval], &[], false));
    }

    fn alloc_with_task(group: &str, version: u64, modify_time: i64, task: &str, started: bool) -> Allocation {
        let mut task_states = HashMap::new();
        let events = if started { vec![TaskEvent { kind: "Started".into(), time: 1, display_message: String::new(), exit_code: None }] } else { vec![] };
        task_states.insert(task.to_string(), TaskState { state: TaskStatus::Running, events });
        Allocation {
            id: format!("a-{modify_time}"), namespace: "default".into(), job_id: "j1".into(), job_version: version,
            eval_id: "e1".into(), followup_eval_id: None, modify_index: modify_time as u64, node_name: "n".into(),
            task_group: group.into(), client_status: ClientStatus::Running, create_time: modify_time, modify_time,
            task_states,
        }
    }

    #[test]
    fn until_started_requires_every_main_task_in_latest_allocation() {
        let mut job = job(JobStatus::Running);
        job.task_groups = vec![TaskGroup { name: "g".into(), tasks: vec![TaskDef { name: "m".into(), lifecycle: None }] }];
        let allocs = vec![alloc_with_task("g", 1, 1, "m", true)];
        assert!(until_started_predicate(&job, &allocs, 1, false));
    }

    #[test]
    fn until_started_ignores_non_sidecar_prestart_tasks() {
        let mut job = job(JobStatus::Running);
        job.task_groups = vec![TaskGroup {
            name: "g".into(),
            tasks: vec![
                TaskDef { name: "m".into(), lifecycle: None },
                TaskDef { name: "p".into(), lifecycle: Some(Lifecycle { hook: LifecycleHook::Prestart, sidecar: false }) },
            ],
        }];
        let mut alloc = alloc_with_task("g", 1, 1, "m", true);
        alloc.task_states.insert("p".to_string(), TaskState { state: TaskStatus::Dead, events: vec![] });
        assert!(until_started_predicate(&job, &[alloc], 1, false));
    }

    #[test]
    fn until_started_requires_sidecar_prestart_tasks() {
        let mut job = job(JobStatus::Running);
        job.task_groups = vec![TaskGroup {
            name: "g".into(),
            tasks: vec![
                TaskDef { name: "m".into(), lifecycle: None },
                TaskDef { name: "s".into(), lifecycle: Some(Lifecycle { hook: LifecycleHook::Prestart, sidecar: true }) },
            ],
        }];
        let mut alloc = alloc_with_task("g", 1, 1, "m", true);
        alloc.task_states.insert("s".to_string(), TaskState { state: TaskStatus::Running, events: vec![] });
        assert!(!until_started_predicate(&job, &[alloc], 1, false), "sidecar prestart task never started");
    }

    #[test]
    fn until_started_picks_most_recently_modified_allocation_per_group() {
        let mut job = job(JobStatus::Running);
        job.task_groups = vec![TaskGroup { name: "g".into(), tasks: vec![TaskDef { name: "m".into(), lifecycle: None }] }];
        let stale = alloc_with_task("g", 1, 1, "m", true);
        let fresh = alloc_with_task("g", 1, 2, "m", false);
        assert!(!until_started_predicate(&job, &[stale, fresh], 1, false), "latest allocation has not started");
    }
}
