//! The aggregate exit-code policy: turns a list of per-task exit codes (or
//! "still unfinished") into the single process exit code this tool reports.
//!
//! Ported from `AllocWorkers.exitcode()` in the original Python tool, which
//! walks the same case table this module's doc comment lists.

/// The fixed process exit codes this tool ever reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// All observed tasks exited zero.
    Success,
    /// Exactly one task ran; its own exit code is reported as-is.
    SingleTask(i32),
    /// More than one task ran and at least one (but not all) failed.
    AnyFailed,
    /// More than one task ran and all of them failed.
    AllFailed,
    /// At least one task never reached a terminal state.
    AnyUnfinished,
    /// The job never produced a single allocation.
    NoAllocations,
    /// An unrecoverable internal error.
    Exception,
    /// The watcher stopped before its termination condition was satisfied.
    Interrupted,
}

impl ExitCode {
    /// The numeric process exit code, per the tool's fixed code table.
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::SingleTask(code) => code,
            ExitCode::AnyFailed => 124,
            ExitCode::AllFailed => 125,
            ExitCode::AnyUnfinished => 126,
            ExitCode::NoAllocations => 127,
            ExitCode::Exception => 1,
            ExitCode::Interrupted => 2,
        }
    }
}

/// One task's contribution to the aggregate: its exit code, or `None` if it
/// never reached a terminal state.
pub type TaskOutcome = Option<i32>;

/// Computes the aggregate exit code for a finished (or abandoned) watch,
/// given every task's outcome observed across every allocation.
///
/// Case order matters: an empty list means no allocations ever appeared
/// (`127`); any unfinished task anywhere takes priority over a single task's
/// own code, since "the only task never finished" should read as 126, not
/// as whatever partial code it last reported.
pub fn aggregate_exit_code(outcomes: &[TaskOutcome]) -> ExitCode {
    if outcomes.is_empty() {
        return ExitCode::NoAllocations;
    }
    if outcomes.iter().any(Option::is_none) {
        return ExitCode::AnyUnfinished;
    }
    let codes: Vec<i32> = outcomes.iter().map(|o| o.expect("checked above")).collect();
    if codes.len() == 1 {
        return ExitCode::SingleTask(codes[0]);
    }
    if codes.iter().all(|&c| c != 0) {
        return ExitCode::AllFailed;
    }
    if codes.iter().any(|&c| c != 0) {
        return ExitCode::AnyFailed;
    }
    ExitCode::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_allocations_is_127() {
        assert_eq!(aggregate_exit_code(&[]).code(), 127);
    }

    #[test]
    fn any_unfinished_wins_over_everything_else() {
        assert_eq!(aggregate_exit_code(&[Some(0), None, Some(1)]).code(), 126);
    }

    #[test]
    fn single_task_passes_through_its_own_code() {
        assert_eq!(aggregate_exit_code(&[Some(17)]).code(), 17);
        assert_eq!(aggregate_exit_code(&[Some(0)]).code(), 0);
    }

    #[test]
    fn all_failed_is_125() {
        assert_eq!(aggregate_exit_code(&[Some(1), Some(2)]).code(), 125);
    }

    #[test]
    fn any_failed_is_124() {
        assert_eq!(aggregate_exit_code(&[Some(0), Some(3)]).code(), 124);
    }

    #[test]
    fn all_succeeded_is_0() {
        assert_eq!(aggregate_exit_code(&[Some(0), Some(0), Some(0)]).code(), 0);
    }
}
