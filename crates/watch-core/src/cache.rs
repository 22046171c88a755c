//! The event cache: subscribes to (or polls) the scheduler, deduplicates
//! events by `(kind, identity, ModifyIndex)`, and publishes ordered batches
//! to whichever watcher is consuming it.
//!
//! Structurally this is the teacher engine's `EngineRuntime::run` loop
//! (`engine.rs`) wearing a different hat: a background task pushes work
//! onto an internal channel, `tokio::select!` multiplexes it against a
//! stop notification, and a `watch`-style "initialized" flag replaces the
//! engine's status snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::client::SchedulerClient;
use crate::error::WatchError;
use crate::types::{Allocation, Deployment, Event, EventTopic, Evaluation, Job, ModifyIndex};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

type InitFuture = Pin<Box<dyn Future<Output = Result<Vec<Event>, WatchError>> + Send>>;
/// Produces the cache's bulk snapshot, called once up front and again on
/// every tick when running in polling mode.
pub type InitFn = Arc<dyn Fn() -> InitFuture + Send + Sync>;
/// Decides whether a not-yet-cached identity should be admitted into the
/// cache. Receives a read-only view of the cache so far, so a filter can
/// e.g. resolve an allocation's `EvalID` against an already-cached
/// evaluation (the job-version filter's reschedule fallback).
pub type SelectFn = Arc<dyn Fn(&Event, &dyn CacheLookup) -> bool + Send + Sync>;

/// Read-only view over the cache's current per-kind maps, passed to
/// `SelectFn` so admission decisions can consult already-cached entities.
pub trait CacheLookup {
    /// Looks up a cached evaluation by id.
    fn evaluation(&self, id: &str) -> Option<&Evaluation>;
}

impl CacheLookup for CacheState {
    fn evaluation(&self, id: &str) -> Option<&Evaluation> {
        self.evals.get(id)
    }
}

/// One batch of newly admitted events, in upstream order.
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// The events admitted from this batch.
    pub events: Vec<Event>,
    /// `true` once the cache has completed its first `init()` pass; batches
    /// before that point come from the bulk snapshot rather than the live
    /// stream.
    pub live: bool,
}

#[derive(Default)]
struct CacheState {
    namespace: String,
    jobs: HashMap<String, Job>,
    evals: HashMap<String, Evaluation>,
    allocs: HashMap<String, Allocation>,
    deploys: HashMap<String, Deployment>,
    indexes: HashMap<(&'static str, String), ModifyIndex>,
}

impl CacheState {
    fn is_new(&self, event: &Event) -> bool {
        if event.namespace() != self.namespace {
            return false;
        }
        match event.modify_index() {
            None => true,
            Some(idx) => {
                let (kind, id) = event.identity();
                self.indexes.get(&(kind, id.to_string())).is_none_or(|&cached| idx > cached)
            }
        }
    }

    fn admit(&mut self, event: Event) {
        let (kind, id) = event.identity();
        if let Some(idx) = event.modify_index() {
            self.indexes.insert((kind, id.to_string()), idx);
        }
        match event {
            Event::JobRegistered(job) => {
                self.jobs.insert(job.id.clone(), job);
            }
            Event::JobDeregistered { id, .. } => {
                self.jobs.remove(&id);
            }
            Event::Evaluation(eval) => {
                self.evals.insert(eval.id.clone(), eval);
            }
            Event::Allocation(alloc) => {
                self.allocs.insert(alloc.id.clone(), alloc);
            }
            Event::Deployment(deploy) => {
                self.deploys.insert(deploy.id.clone(), deploy);
            }
        }
    }
}

/// Applies the cache's admission rule to a batch of incoming events,
/// returning only those that change cache state. An event whose identity is
/// already cached is admitted unconditionally (on the theory that whatever
/// accepted it the first time already decided it matters); a never-seen
/// identity must additionally satisfy `select`.
fn filter_new(state: &mut CacheState, events: Vec<Event>, select: &SelectFn) -> Vec<Event> {
    let mut out = Vec::new();
    for event in events {
        if !state.is_new(&event) {
            continue;
        }
        let (kind, id) = event.identity();
        let already_cached = match kind {
            "job" => state.jobs.contains_key(id),
            "eval" => state.evals.contains_key(id),
            "alloc" => state.allocs.contains_key(id),
            "deploy" => state.deploys.contains_key(id),
            _ => false,
        };
        if already_cached || select(&event, state) {
            state.admit(event.clone());
            out.push(event);
        }
    }
    out
}

/// A live, deduplicating view over four scheduler entity kinds.
pub struct EventCache {
    state: Arc<Mutex<CacheState>>,
    stop_requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
    batches: Mutex<mpsc::UnboundedReceiver<Result<EventBatch, WatchError>>>,
    task: tokio::task::JoinHandle<()>,
}

impl EventCache {
    /// Starts the cache's background task. `init` is called once
    /// synchronously (its result becomes the first batch with
    /// `live = false`), then the background task either follows
    /// `client.event_stream(topics)` or, in polling mode, re-calls `init`
    /// on a fixed one-second cadence.
    pub async fn start(
        client: SchedulerClient,
        namespace: String,
        topics: Vec<EventTopic>,
        select: SelectFn,
        init: InitFn,
        polling: bool,
    ) -> Result<Self, WatchError> {
        let state = Arc::new(Mutex::new(CacheState { namespace, ..Default::default() }));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let initial = init().await?;
        {
            let mut guard = state.lock().await;
            let admitted = filter_new(&mut guard, initial, &select);
            let _ = tx.send(Ok(EventBatch { events: admitted, live: false }));
        }

        let task = {
            let state = Arc::clone(&state);
            let stop_requested = Arc::clone(&stop_requested);
            let notify = Arc::clone(&notify);
            tokio::spawn(async move {
                let result = if polling {
                    Self::run_polling(state, stop_requested, notify, select, init, tx.clone()).await
                } else {
                    Self::run_streaming(client, state, stop_requested, notify, select, topics, init, tx.clone())
                        .await
                };
                if let Err(e) = result {
                    let _ = tx.send(Err(e));
                }
            })
        };

        Ok(EventCache { state, stop_requested, notify, batches: Mutex::new(rx), task })
    }

    async fn run_streaming(
        client: SchedulerClient,
        state: Arc<Mutex<CacheState>>,
        stop_requested: Arc<AtomicBool>,
        notify: Arc<Notify>,
        select: SelectFn,
        topics: Vec<EventTopic>,
        init: InitFn,
        tx: mpsc::UnboundedSender<Result<EventBatch, WatchError>>,
    ) -> Result<(), WatchError> {
        let mut stream = match client.event_stream(&topics).await {
            Ok(stream) => Box::pin(stream),
            Err(WatchError::PermissionDenied) => {
                tracing::warn!("scheduler denied the event stream, falling back to polling");
                return Self::run_polling(state, stop_requested, notify, select, init, tx).await;
            }
            Err(e) => return Err(e),
        };

        let mut carry = Vec::new();
        loop {
            if stop_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                _ = notify.notified() => {
                    if stop_requested.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                }
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { return Ok(()) };
                    let chunk = chunk?;
                    carry.extend_from_slice(&chunk);
                    while let Some(pos) = carry.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = carry.drain(..=pos).collect();
                        let line = &line[..line.len() - 1];
                        match crate::client::parse_stream_line(line) {
                            Ok(events) if events.is_empty() => {}
                            Ok(events) => {
                                let mut guard = state.lock().await;
                                let admitted = filter_new(&mut guard, events, &select);
                                drop(guard);
                                if !admitted.is_empty() {
                                    let _ = tx.send(Ok(EventBatch { events: admitted, live: true }));
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "malformed event-stream chunk, skipping");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_polling(
        state: Arc<Mutex<CacheState>>,
        stop_requested: Arc<AtomicBool>,
        notify: Arc<Notify>,
        select: SelectFn,
        init: InitFn,
        tx: mpsc::UnboundedSender<Result<EventBatch, WatchError>>,
    ) -> Result<(), WatchError> {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.tick().await;
        loop {
            if stop_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                _ = notify.notified() => {
                    if stop_requested.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    let snapshot = init().await?;
                    let mut guard = state.lock().await;
                    let admitted = filter_new(&mut guard, snapshot, &select);
                    drop(guard);
                    if !admitted.is_empty() {
                        let _ = tx.send(Ok(EventBatch { events: admitted, live: true }));
                    }
                }
            }
        }
    }

    /// Awaits the next batch of newly admitted events, or `None` once the
    /// cache has stopped and drained.
    pub async fn next_batch(&self) -> Option<Result<EventBatch, WatchError>> {
        self.batches.lock().await.recv().await
    }

    /// Returns a cloned snapshot of the currently cached job, if any.
    pub async fn job(&self) -> Option<Job> {
        self.state.lock().await.jobs.values().next().cloned()
    }

    /// Returns cloned snapshots of all cached evaluations.
    pub async fn evaluations(&self) -> Vec<Evaluation> {
        self.state.lock().await.evals.values().cloned().collect()
    }

    /// Returns cloned snapshots of all cached allocations.
    pub async fn allocations(&self) -> Vec<Allocation> {
        self.state.lock().await.allocs.values().cloned().collect()
    }

    /// Returns cloned snapshots of all cached deployments.
    pub async fn deployments(&self) -> Vec<Deployment> {
        self.state.lock().await.deploys.values().cloned().collect()
    }

    /// Looks up a single cached evaluation by id.
    pub async fn evaluation(&self, id: &str) -> Option<Evaluation> {
        self.state.lock().await.evals.get(id).cloned()
    }

    /// Idempotently requests that the background task stop; unblocks a
    /// pending `next_batch` with a final `None`.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Waits for the background task to exit after `stop()`.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientStatus, JobStatus};
    use std::collections::HashMap as Map;

    fn job(id: &str, modify_index: u64) -> Job {
        Job {
            id: id.to_string(),
            namespace: "default".to_string(),
            version: 0,
            job_modify_index: modify_index,
            status: JobStatus::Running,
            task_groups: vec![],
        }
    }

    fn alloc(id: &str, modify_index: u64) -> Allocation {
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            job_id: "j1".to_string(),
            job_version: 0,
            eval_id: "e1".to_string(),
            followup_eval_id: None,
            modify_index,
            node_name: "n1".to_string(),
            task_group: "g1".to_string(),
            client_status: ClientStatus::Running,
            create_time: 0,
            modify_time: 0,
            task_states: Map::new(),
        }
    }

    fn always_select(_: &Event, _: &dyn CacheLookup) -> bool {
        true
    }

    #[test]
    fn repeated_event_is_not_readmitted() {
        let mut state = CacheState { namespace: "default".to_string(), ..Default::default() };
        let select: SelectFn = Arc::new(always_select);
        let first = filter_new(&mut state, vec![Event::JobRegistered(job("j1", 5))], &select);
        assert_eq!(first.len(), 1);
        let second = filter_new(&mut state, vec![Event::JobRegistered(job("j1", 5))], &select);
        assert!(second.is_empty(), "re-delivering the same modify index must not re-admit it");
    }

    #[test]
    fn stale_modify_index_is_rejected() {
        let mut state = CacheState { namespace: "default".to_string(), ..Default::default() };
        let select: SelectFn = Arc::new(always_select);
        filter_new(&mut state, vec![Event::Allocation(alloc("a1", 10))], &select);
        let stale = filter_new(&mut state, vec![Event::Allocation(alloc("a1", 3))], &select);
        assert!(stale.is_empty());
        assert_eq!(state.indexes.get(&("alloc", "a1".to_string())), Some(&10));
    }

    #[test]
    fn job_deregistered_clears_job_but_not_allocations() {
        let mut state = CacheState { namespace: "default".to_string(), ..Default::default() };
        let select: SelectFn = Arc::new(always_select);
        filter_new(&mut state, vec![Event::JobRegistered(job("j1", 1))], &select);
        filter_new(&mut state, vec![Event::Allocation(alloc("a1", 1))], &select);
        filter_new(
            &mut state,
            vec![Event::JobDeregistered { id: "j1".to_string(), namespace: "default".to_string() }],
            &select,
        );
        assert!(state.jobs.is_empty());
        assert_eq!(state.allocs.len(), 1);
    }

    #[test]
    fn other_namespace_is_rejected() {
        let mut state = CacheState { namespace: "default".to_string(), ..Default::default() };
        let select: SelectFn = Arc::new(always_select);
        let mut j = job("j1", 1);
        j.namespace = "other".to_string();
        let out = filter_new(&mut state, vec![Event::JobRegistered(j)], &select);
        assert!(out.is_empty());
    }
}
