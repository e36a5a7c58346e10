use std::fmt;
use std::sync::RwLock;

/// Lifecycle state of a job.
///
/// `Stopped` and `TimedOut` both mean the job was SIGKILLed; the distinction
/// records the cause, not the effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// The job is still running; its exit code is undefined.
    Running,
    /// The child exited on its own; the exit code is the child's.
    Completed,
    /// The job was killed by an explicit stop.
    Stopped,
    /// The job was killed because its timeout elapsed.
    TimedOut,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Stopped => "STOPPED",
            JobStatus::TimedOut => "TIMEDOUT",
        };
        f.write_str(s)
    }
}

/// Lock-protected status cell.
///
/// Transitions out of `Running` go through `update_if`, so the first of
/// stop/timeout/natural-exit to observe `Running` wins and the losers become
/// no-ops.
#[derive(Debug)]
pub(crate) struct StatusCell {
    value: RwLock<JobStatus>,
}

impl StatusCell {
    pub(crate) fn new(value: JobStatus) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    pub(crate) fn get(&self) -> JobStatus {
        *self.value.read().unwrap()
    }

    pub(crate) fn set(&self, new: JobStatus) {
        *self.value.write().unwrap() = new;
    }

    /// Sets the status to `new` only if it currently equals `old`.
    pub(crate) fn update_if(&self, old: JobStatus, new: JobStatus) {
        let mut value = self.value.write().unwrap();
        if *value == old {
            *value = new;
        }
    }
}
