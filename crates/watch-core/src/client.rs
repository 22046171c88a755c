//! Typed HTTP access to the scheduler: GETs, submit/stop, and the two
//! long-lived byte streams (event stream, task log stream).
//!
//! Follows the teacher engine's `backend.rs` shape: one shared
//! [`reqwest::Client`], `.post(url).json(&body).send().await?`, and a
//! `!status.is_success()` check that converts non-2xx responses into a
//! typed error before the caller ever sees a raw status code.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WatchError;
use crate::types::{
    Allocation, AllocationMetric, ClientStatus, Deployment, DeploymentStatus, Event, EventTopic,
    EvalStatus, Evaluation, Job, JobStatus, TaskDef, TaskEvent, TaskGroup, TaskState, TaskStatus,
};

/// A shared, connection-pooled client for one scheduler address.
///
/// Safe to call concurrently from multiple followers; each follow opens its
/// own response on top of the same pooled connection set, matching the
/// "one session" discipline the engine crate's `run_engine` sets up for its
/// backend client.
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    http: reqwest::Client,
    address: String,
    namespace: String,
    token: Option<String>,
}

/// Summary counters returned by `job/{id}/summary`, used by the success
/// classifier that gates `--purge-successful`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSummaryCounts {
    /// Allocations not yet placed.
    #[serde(default)]
    pub queued: u64,
    /// Allocations that failed to place.
    #[serde(default)]
    pub failed: u64,
    /// Allocations starting up.
    #[serde(default)]
    pub starting: u64,
    /// Allocations that lost their node.
    #[serde(default)]
    pub lost: u64,
    /// Allocations that completed successfully.
    #[serde(default)]
    pub complete: u64,
    /// Allocations currently running.
    #[serde(default)]
    pub running: u64,
}

impl JobSummaryCounts {
    /// True once the job has nothing left queued, failed, starting, or lost,
    /// and at least one allocation finished.
    pub fn finished_successfully(&self) -> bool {
        self.queued == 0 && self.failed == 0 && self.starting == 0 && self.lost == 0 && self.complete != 0
    }

    /// True once the job has nothing left queued, failed, starting, or lost,
    /// and at least one allocation is running.
    pub fn running_successfully(&self) -> bool {
        self.queued == 0 && self.failed == 0 && self.starting == 0 && self.lost == 0 && self.running != 0
    }
}

#[derive(Serialize)]
struct StopRequest {
    #[serde(rename = "Purge")]
    purge: bool,
}

impl SchedulerClient {
    /// Builds a client bound to one scheduler address and namespace.
    pub fn new(
        address: impl Into<String>,
        namespace: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, WatchError> {
        let namespace = namespace.into();
        let namespace = if namespace == "*" { "default".to_string() } else { namespace };
        let http = reqwest::Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(SchedulerClient { http, address: address.into(), namespace, token })
    }

    /// The namespace this client was constructed with (already normalized:
    /// `"*"` becomes `"default"`).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{path}", self.address.trim_end_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, self.url(path)).query(&[("namespace", &self.namespace)]);
        if let Some(token) = &self.token {
            req = req.header("X-Nomad-Token", token);
        }
        req
    }

    async fn check_status(res: reqwest::Response, what: &str) -> Result<reqwest::Response, WatchError> {
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(WatchError::NotFound(what.to_string()));
        }
        if res.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(WatchError::PermissionDenied);
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(WatchError::Internal(format!("{status}: {body}")));
        }
        Ok(res)
    }

    /// Fetches a job, its evaluations, allocations, and deployments and
    /// returns them as a batch of `Event`s suitable for seeding the cache's
    /// `init()` snapshot. Returns an empty job-deregistered-style snapshot
    /// when the job does not exist and `tolerate_missing` is set (used by
    /// purge-mode termination).
    pub async fn init_snapshot(&self, job_id: &str, tolerate_missing: bool) -> Result<Vec<Event>, WatchError> {
        let job = match self.get_job(job_id).await {
            Ok(job) => Some(job),
            Err(e) if e.is_not_found() && tolerate_missing => None,
            Err(e) => return Err(e),
        };

        let mut events = Vec::new();
        if let Some(job) = job {
            events.push(Event::JobRegistered(job));
        }
        events.extend(self.list_evaluations(job_id).await?.into_iter().map(Event::Evaluation));
        events.extend(self.list_allocations(job_id).await?.into_iter().map(Event::Allocation));
        events.extend(self.list_deployments(job_id).await?.into_iter().map(Event::Deployment));
        Ok(events)
    }

    /// `GET /v1/job/{id}`.
    pub async fn get_job(&self, job_id: &str) -> Result<Job, WatchError> {
        let res = self.request(reqwest::Method::GET, &format!("/job/{job_id}")).send().await?;
        let res = Self::check_status(res, job_id).await?;
        let dto: JobDto = res.json().await?;
        Ok(dto.into_job())
    }

    /// `GET /v1/job/{id}/evaluations`.
    pub async fn list_evaluations(&self, job_id: &str) -> Result<Vec<Evaluation>, WatchError> {
        let res = self.request(reqwest::Method::GET, &format!("/job/{job_id}/evaluations")).send().await?;
        let res = Self::check_status(res, job_id).await?;
        let dtos: Vec<EvaluationDto> = res.json().await?;
        Ok(dtos.into_iter().map(EvaluationDto::into_evaluation).collect())
    }

    /// `GET /v1/job/{id}/allocations`.
    pub async fn list_allocations(&self, job_id: &str) -> Result<Vec<Allocation>, WatchError> {
        let res = self.request(reqwest::Method::GET, &format!("/job/{job_id}/allocations")).send().await?;
        let res = Self::check_status(res, job_id).await?;
        let dtos: Vec<AllocationDto> = res.json().await?;
        Ok(dtos.into_iter().map(AllocationDto::into_allocation).collect())
    }

    /// `GET /v1/job/{id}/deployments`.
    pub async fn list_deployments(&self, job_id: &str) -> Result<Vec<Deployment>, WatchError> {
        let res = self.request(reqwest::Method::GET, &format!("/job/{job_id}/deployments")).send().await?;
        let res = Self::check_status(res, job_id).await?;
        let dtos: Vec<DeploymentDto> = res.json().await?;
        Ok(dtos.into_iter().map(DeploymentDto::into_deployment).collect())
    }

    /// `GET /v1/job/{id}/summary`.
    pub async fn job_summary(&self, job_id: &str) -> Result<JobSummaryCounts, WatchError> {
        let res = self.request(reqwest::Method::GET, &format!("/job/{job_id}/summary")).send().await?;
        let res = Self::check_status(res, job_id).await?;
        let body: Value = res.json().await?;
        let mut total = JobSummaryCounts::default();
        if let Some(groups) = body.get("Summary").and_then(Value::as_object) {
            for group in groups.values() {
                total.queued += group.get("Queued").and_then(Value::as_u64).unwrap_or(0);
                total.failed += group.get("Failed").and_then(Value::as_u64).unwrap_or(0);
                total.starting += group.get("Starting").and_then(Value::as_u64).unwrap_or(0);
                total.lost += group.get("Lost").and_then(Value::as_u64).unwrap_or(0);
                total.complete += group.get("Complete").and_then(Value::as_u64).unwrap_or(0);
                total.running += group.get("Running").and_then(Value::as_u64).unwrap_or(0);
            }
        }
        Ok(total)
    }

    /// `GET /v1/evaluation/{id}`.
    pub async fn get_evaluation(&self, eval_id: &str) -> Result<Evaluation, WatchError> {
        let res = self.request(reqwest::Method::GET, &format!("/evaluation/{eval_id}")).send().await?;
        let res = Self::check_status(res, eval_id).await?;
        let dto: EvaluationDto = res.json().await?;
        Ok(dto.into_evaluation())
    }

    /// `GET /v1/allocation/{id}`.
    pub async fn get_allocation(&self, alloc_id: &str) -> Result<Allocation, WatchError> {
        let res = self.request(reqwest::Method::GET, &format!("/allocation/{alloc_id}")).send().await?;
        let res = Self::check_status(res, alloc_id).await?;
        let dto: AllocationDto = res.json().await?;
        Ok(dto.into_allocation())
    }

    /// `POST /v1/jobs` with a pre-built job spec (JSON). Returns the id of
    /// the evaluation the scheduler raised for this submission, if any.
    pub async fn submit_job(&self, job_spec_json: Value) -> Result<Option<String>, WatchError> {
        let res = self
            .request(reqwest::Method::POST, "/jobs")
            .json(&serde_json::json!({ "Job": job_spec_json }))
            .send()
            .await?;
        let res = Self::check_status(res, "job submission").await?;
        let body: Value = res.json().await.unwrap_or_default();
        Ok(body.get("EvalID").and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string))
    }

    /// `DELETE /v1/job/{id}?purge=`.
    pub async fn stop_job(&self, job_id: &str, purge: bool) -> Result<(), WatchError> {
        let res = self
            .request(reqwest::Method::DELETE, &format!("/job/{job_id}"))
            .query(&[("purge", purge.to_string())])
            .send()
            .await;
        match res {
            Ok(res) => {
                if res.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(());
                }
                Self::check_status(res, job_id).await?;
                Ok(())
            }
            Err(e) => Err(WatchError::Transport(e)),
        }
    }

    /// `GET /v1/allocations?prefix=`. Resolves an abbreviated allocation id
    /// to its full id and namespace; used by the `alloc` subcommand, whose
    /// argument is usually a short prefix rather than a full UUID.
    pub async fn find_allocations_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, WatchError> {
        #[derive(Deserialize)]
        struct AllocStubDto {
            #[serde(rename = "ID")]
            id: String,
            #[serde(rename = "Namespace", default)]
            namespace: String,
        }

        let res = self
            .request(reqwest::Method::GET, "/allocations")
            .query(&[("prefix", prefix)])
            .send()
            .await?;
        let res = Self::check_status(res, "allocations").await?;
        let stubs: Vec<AllocStubDto> = res.json().await?;
        Ok(stubs
            .into_iter()
            .map(|s| (s.id, if s.namespace.is_empty() { "default".to_string() } else { s.namespace }))
            .collect())
    }

    /// Opens `GET /v1/event/stream?topic=...` for the given topics and
    /// returns the raw byte stream; callers split on newlines and parse
    /// each line as one JSON event batch.
    pub async fn event_stream(
        &self,
        topics: &[EventTopic],
    ) -> Result<impl Stream<Item = Result<Bytes, WatchError>>, WatchError> {
        let mut req = self.request(reqwest::Method::GET, "/event/stream");
        for topic in topics {
            req = req.query(&[("topic", topic.as_wire())]);
        }
        let res = req.send().await?;
        let res = Self::check_status(res, "event stream").await?;
        Ok(res.bytes_stream().map(|r| r.map_err(WatchError::Transport)))
    }

    /// Opens `GET /v1/client/fs/logs/{allocid}` in follow mode for one
    /// task's stdout or stderr and returns the raw byte stream.
    pub async fn follow_log(
        &self,
        alloc_id: &str,
        task: &str,
        log_type: &str,
        tail: bool,
    ) -> Result<impl Stream<Item = Result<Bytes, WatchError>>, WatchError> {
        let (origin, offset) = if tail { ("end", 50_000) } else { ("start", 0) };
        let res = self
            .request(reqwest::Method::GET, &format!("/client/fs/logs/{alloc_id}"))
            .query(&[
                ("task", task),
                ("type", log_type),
                ("follow", "true"),
                ("origin", origin),
                ("offset", &offset.to_string()),
            ])
            .send()
            .await?;
        let res = Self::check_status(res, alloc_id).await?;
        Ok(res.bytes_stream().map(|r| r.map_err(WatchError::Transport)))
    }
}

// --- wire DTOs --------------------------------------------------------

#[derive(Deserialize)]
struct JobDto {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Namespace", default)]
    namespace: String,
    #[serde(rename = "Version")]
    version: u64,
    #[serde(rename = "JobModifyIndex")]
    job_modify_index: u64,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "TaskGroups", default)]
    task_groups: Vec<TaskGroupDto>,
}

#[derive(Deserialize)]
struct TaskGroupDto {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Tasks", default)]
    tasks: Vec<TaskDefDto>,
}

#[derive(Deserialize)]
struct TaskDefDto {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Lifecycle")]
    lifecycle: Option<LifecycleDto>,
}

#[derive(Deserialize)]
struct LifecycleDto {
    #[serde(rename = "Hook")]
    hook: String,
    #[serde(rename = "Sidecar", default)]
    sidecar: bool,
}

impl JobDto {
    fn into_job(self) -> Job {
        let namespace = if self.namespace.is_empty() { "default".to_string() } else { self.namespace };
        Job {
            id: self.id,
            namespace,
            version: self.version,
            job_modify_index: self.job_modify_index,
            status: match self.status.as_str() {
                "running" => JobStatus::Running,
                "dead" => JobStatus::Dead,
                _ => JobStatus::Pending,
            },
            task_groups: self
                .task_groups
                .into_iter()
                .map(|g| TaskGroup {
                    name: g.name,
                    tasks: g
                        .tasks
                        .into_iter()
                        .map(|t| TaskDef {
                            name: t.name,
                            lifecycle: t.lifecycle.map(|l| crate::types::Lifecycle {
                                hook: match l.hook.as_str() {
                                    "poststart" => crate::types::LifecycleHook::Poststart,
                                    "poststop" => crate::types::LifecycleHook::Poststop,
                                    _ => crate::types::LifecycleHook::Prestart,
                                },
                                sidecar: l.sidecar,
                            }),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct EvaluationDto {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Namespace", default)]
    namespace: String,
    #[serde(rename = "JobID")]
    job_id: String,
    #[serde(rename = "JobModifyIndex")]
    job_modify_index: u64,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "StatusDescription", default)]
    status_description: String,
    #[serde(rename = "FailedTGAllocs", default)]
    failed_tg_allocs: HashMap<String, Value>,
    #[serde(rename = "WaitUntil")]
    wait_until: Option<i64>,
}

impl EvaluationDto {
    fn into_evaluation(self) -> Evaluation {
        let namespace = if self.namespace.is_empty() { "default".to_string() } else { self.namespace };
        Evaluation {
            id: self.id,
            namespace,
            job_id: self.job_id,
            job_modify_index: self.job_modify_index,
            modify_index: self.modify_index,
            status: match self.status.as_str() {
                "complete" => EvalStatus::Complete,
                "blocked" => EvalStatus::Blocked,
                "failed" => EvalStatus::Failed,
                "canceled" => EvalStatus::Canceled,
                _ => EvalStatus::Pending,
            },
            status_description: self.status_description,
            failed_tg_allocs: self
                .failed_tg_allocs
                .into_iter()
                .map(|(group, v)| {
                    let description = v.get("DisplayMessage").and_then(Value::as_str).map(str::to_string);
                    (group, AllocationMetric { description })
                })
                .collect(),
            wait_until: self.wait_until,
        }
    }
}

#[derive(Deserialize)]
struct AllocationDto {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Namespace", default)]
    namespace: String,
    #[serde(rename = "JobID")]
    job_id: String,
    #[serde(rename = "JobVersion", default)]
    job_version: u64,
    #[serde(rename = "EvalID")]
    eval_id: String,
    #[serde(rename = "FollowupEvalID", default)]
    followup_eval_id: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
    #[serde(rename = "NodeName", default)]
    node_name: String,
    #[serde(rename = "TaskGroup")]
    task_group: String,
    #[serde(rename = "ClientStatus")]
    client_status: String,
    #[serde(rename = "CreateTime", default)]
    create_time: i64,
    #[serde(rename = "ModifyTime", default)]
    modify_time: i64,
    #[serde(rename = "TaskStates", default)]
    task_states: HashMap<String, TaskStateDto>,
}

#[derive(Deserialize)]
struct TaskStateDto {
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Events", default)]
    events: Vec<TaskEvent>,
}

impl AllocationDto {
    fn into_allocation(self) -> Allocation {
        let namespace = if self.namespace.is_empty() { "default".to_string() } else { self.namespace };
        Allocation {
            id: self.id,
            namespace,
            job_id: self.job_id,
            job_version: self.job_version,
            eval_id: self.eval_id,
            followup_eval_id: self.followup_eval_id.filter(|s| !s.is_empty()),
            modify_index: self.modify_index,
            node_name: self.node_name,
            task_group: self.task_group,
            client_status: match self.client_status.as_str() {
                "running" => ClientStatus::Running,
                "complete" => ClientStatus::Complete,
                "failed" => ClientStatus::Failed,
                "lost" => ClientStatus::Lost,
                _ => ClientStatus::Pending,
            },
            create_time: self.create_time,
            modify_time: self.modify_time,
            task_states: self
                .task_states
                .into_iter()
                .map(|(name, s)| {
                    let state = match s.state.as_str() {
                        "running" => TaskStatus::Running,
                        "dead" => TaskStatus::Dead,
                        _ => TaskStatus::Pending,
                    };
                    (name, TaskState { state, events: s.events })
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct DeploymentDto {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Namespace", default)]
    namespace: String,
    #[serde(rename = "JobID")]
    job_id: String,
    #[serde(rename = "JobModifyIndex")]
    job_modify_index: u64,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
    #[serde(rename = "Status")]
    status: String,
}

impl DeploymentDto {
    fn into_deployment(self) -> Deployment {
        let namespace = if self.namespace.is_empty() { "default".to_string() } else { self.namespace };
        Deployment {
            id: self.id,
            namespace,
            job_id: self.job_id,
            job_modify_index: self.job_modify_index,
            modify_index: self.modify_index,
            status: match self.status.as_str() {
                "running" => DeploymentStatus::Running,
                "pending" => DeploymentStatus::Pending,
                "blocked" => DeploymentStatus::Blocked,
                "paused" => DeploymentStatus::Paused,
                "successful" => DeploymentStatus::Successful,
                "failed" => DeploymentStatus::Failed,
                "canceled" => DeploymentStatus::Canceled,
                _ => DeploymentStatus::Initializing,
            },
        }
    }
}

/// Parses one line of the event stream (one JSON object, possibly an empty
/// `{}` heartbeat) into zero or more typed events.
///
/// The envelope shape is `{"Events":[{"Topic":..,"Type":..,"Payload":{..}}]}`;
/// a bare `{}` or a blank line yields no events and is not an error.
pub fn parse_stream_line(line: &[u8]) -> Result<Vec<Event>, WatchError> {
    let line = std::str::from_utf8(line).map_err(|e| WatchError::MalformedChunk(e.to_string()))?.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let envelope: Value = serde_json::from_str(line).map_err(|e| WatchError::MalformedChunk(e.to_string()))?;
    let Some(raw_events) = envelope.get("Events").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(raw_events.len());
    for raw in raw_events {
        let topic = raw.get("Topic").and_then(Value::as_str).unwrap_or_default();
        let kind = raw.get("Type").and_then(Value::as_str).unwrap_or_default();
        let Some(payload) = raw.get("Payload") else { continue };
        match topic {
            "Job" => {
                let Some(job_raw) = payload.get("Job") else { continue };
                if kind == "JobDeregistered" {
                    let id = job_raw.get("ID").and_then(Value::as_str).unwrap_or_default().to_string();
                    let namespace =
                        job_raw.get("Namespace").and_then(Value::as_str).unwrap_or("default").to_string();
                    out.push(Event::JobDeregistered { id, namespace });
                } else {
                    let dto: JobDto = serde_json::from_value(job_raw.clone())
                        .map_err(|e| WatchError::MalformedChunk(e.to_string()))?;
                    out.push(Event::JobRegistered(dto.into_job()));
                }
            }
            "Evaluation" => {
                let Some(eval_raw) = payload.get("Evaluation") else { continue };
                let dto: EvaluationDto = serde_json::from_value(eval_raw.clone())
                    .map_err(|e| WatchError::MalformedChunk(e.to_string()))?;
                out.push(Event::Evaluation(dto.into_evaluation()));
            }
            "Allocation" => {
                let Some(alloc_raw) = payload.get("Allocation") else { continue };
                let dto: AllocationDto = serde_json::from_value(alloc_raw.clone())
                    .map_err(|e| WatchError::MalformedChunk(e.to_string()))?;
                out.push(Event::Allocation(dto.into_allocation()));
            }
            "Deployment" => {
                let Some(deploy_raw) = payload.get("Deployment") else { continue };
                let dto: DeploymentDto = serde_json::from_value(deploy_raw.clone())
                    .map_err(|e| WatchError::MalformedChunk(e.to_string()))?;
                out.push(Event::Deployment(dto.into_deployment()));
            }
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_heartbeat_lines_yield_nothing() {
        assert!(parse_stream_line(b"").unwrap().is_empty());
        assert!(parse_stream_line(b"{}").unwrap().is_empty());
    }

    #[test]
    fn malformed_json_is_reported_not_panicked() {
        let err = parse_stream_line(b"{not json").unwrap_err();
        assert!(matches!(err, WatchError::MalformedChunk(_)));
    }

    #[test]
    fn job_deregistered_clears_only_identity() {
        let line = br#"{"Events":[{"Topic":"Job","Type":"JobDeregistered","Payload":{"Job":{"ID":"j1","Namespace":"default"}}}]}"#;
        let events = parse_stream_line(line).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::JobDeregistered { id, .. } if id == "j1"));
    }
}
