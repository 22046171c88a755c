//! The `job@task` / `job@group@task` argument micro-syntax: a convenience
//! for restricting log/event output to one task without reaching for the
//! `--task` regex.

/// A parsed `JOB[@[GROUP@]TASK]` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPath {
    /// The job identifier, always present.
    pub job_id: String,
    /// An explicit group name, if the argument had two `@`s.
    pub group: Option<String>,
    /// An explicit task name, if the argument had at least one `@`.
    pub task: Option<String>,
}

impl JobPath {
    /// Parses `job`, `job@task`, or `job@group@task`. An empty job id is rejected.
    pub fn parse(arg: &str) -> Result<Self, String> {
        let mut parts = arg.splitn(3, '@');
        let job_id = parts.next().unwrap_or_default().to_string();
        if job_id.is_empty() {
            return Err(format!("empty job id in argument {arg:?}"));
        }
        let second = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let third = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let (group, task) = match (second, third) {
            (Some(group), Some(task)) => (Some(group), Some(task)),
            (Some(task), None) => (None, Some(task)),
            (None, _) => (None, None),
        };
        Ok(JobPath { job_id, group, task })
    }

    /// A regex pattern equivalent to this path's task restriction, suitable
    /// for feeding into the task handler's `--task` filter. `None` means
    /// "no restriction beyond the job id itself".
    pub fn task_pattern(&self) -> Option<String> {
        match (&self.group, &self.task) {
            (_, Some(task)) => Some(format!("^{}$", regex::escape(task))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_only() {
        let p = JobPath::parse("web").unwrap();
        assert_eq!(p, JobPath { job_id: "web".into(), group: None, task: None });
    }

    #[test]
    fn job_and_task() {
        let p = JobPath::parse("web@api").unwrap();
        assert_eq!(p, JobPath { job_id: "web".into(), group: None, task: Some("api".into()) });
    }

    #[test]
    fn job_group_and_task() {
        let p = JobPath::parse("web@api@nginx").unwrap();
        assert_eq!(p.task, Some("nginx".to_string()));
        assert_eq!(p.task_pattern(), Some("^nginx$".to_string()));
    }

    #[test]
    fn empty_job_id_is_rejected() {
        assert!(JobPath::parse("@group").is_err());
    }
}
