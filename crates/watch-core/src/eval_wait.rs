//! Blocks until a single evaluation leaves `pending`, reporting any
//! per-group placement failures it recorded along the way.

use std::sync::Arc;

use crate::cache::{CacheLookup, EventCache, InitFn, SelectFn};
use crate::client::SchedulerClient;
use crate::error::WatchError;
use crate::types::{EvalStatus, Evaluation, Event, EventTopic};

/// One placement failure reported against a task group by a completed evaluation.
#[derive(Debug, Clone)]
pub struct PlacementFailure {
    /// Task group the failure applies to.
    pub group: String,
    /// The scheduler's description of why placement failed.
    pub description: String,
}

/// Waits for `eval_id` to leave `pending`. Returns the completed evaluation
/// plus any placement failures it carries. Fails if the evaluation reaches
/// any terminal status other than `complete`.
pub async fn wait_for_evaluation(
    client: SchedulerClient,
    eval_id: String,
    polling: bool,
) -> Result<(Evaluation, Vec<PlacementFailure>), WatchError> {
    let select: SelectFn = {
        let eval_id = eval_id.clone();
        Arc::new(move |event: &Event, _lookup: &dyn CacheLookup| {
            matches!(event, Event::Evaluation(e) if e.id == eval_id)
        })
    };
    let init: InitFn = {
        let client = client.clone();
        let eval_id = eval_id.clone();
        Arc::new(move || {
            let client = client.clone();
            let eval_id = eval_id.clone();
            Box::pin(async move { Ok(vec![Event::Evaluation(client.get_evaluation(&eval_id).await?)]) })
        })
    };

    let namespace = client.namespace().to_string();
    let cache =
        EventCache::start(client, namespace, vec![EventTopic::Evaluation], select, init, polling).await?;

    let result = loop {
        if let Some(eval) = cache.evaluation(&eval_id).await {
            if !eval.status.is_pending() {
                break finish(eval);
            }
        }
        match cache.next_batch().await {
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(e),
            None => break Err(WatchError::Internal(format!("evaluation {eval_id} stream ended unexpectedly"))),
        }
    };

    cache.stop();
    cache.join().await;
    result
}

fn finish(eval: Evaluation) -> Result<(Evaluation, Vec<PlacementFailure>), WatchError> {
    if eval.status != EvalStatus::Complete {
        return Err(WatchError::EvaluationNotComplete {
            id: eval.id.clone(),
            status_description: eval.status_description.clone(),
        });
    }
    let failures = eval
        .failed_tg_allocs
        .iter()
        .filter_map(|(group, metric)| {
            metric.description.clone().map(|description| PlacementFailure { group: group.clone(), description })
        })
        .collect();
    Ok((eval, failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn eval(status: EvalStatus) -> Evaluation {
        Evaluation {
            id: "e1".into(),
            namespace: "default".into(),
            job_id: "j1".into(),
            job_modify_index: 1,
            modify_index: 1,
            status,
            status_description: "boom".into(),
            failed_tg_allocs: HashMap::new(),
            wait_until: None,
        }
    }

    #[test]
    fn complete_evaluation_finishes_ok() {
        assert!(finish(eval(EvalStatus::Complete)).is_ok());
    }

    #[test]
    fn failed_evaluation_reports_status_description() {
        let err = finish(eval(EvalStatus::Failed)).unwrap_err();
        assert!(matches!(err, WatchError::EvaluationNotComplete { status_description, .. } if status_description == "boom"));
    }

    #[test]
    fn placement_failures_are_collected_per_group() {
        let mut e = eval(EvalStatus::Complete);
        e.failed_tg_allocs.insert(
            "web".to_string(),
            crate::types::AllocationMetric { description: Some("no nodes".to_string()) },
        );
        let (_, failures) = finish(e).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].group, "web");
    }
}
