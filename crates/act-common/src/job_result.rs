// JobResult: outcome of one job run as seen by the caller, and its mapping
// to process return codes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobResult {
    Succeeded,
    Failed,
    /// The job `if` was false or no image resolved for its platform.
    Skipped,
}

impl JobResult {
    /// Process exit code for this result. A skipped job is not an error.
    pub fn return_code(self) -> i32 {
        match self {
            JobResult::Succeeded | JobResult::Skipped => 0,
            JobResult::Failed => 1,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, JobResult::Failed)
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobResult::Succeeded => write!(f, "Succeeded"),
            JobResult::Failed => write!(f, "Failed"),
            JobResult::Skipped => write!(f, "Skipped"),
        }
    }
}
