use serde_json::Value;

use super::JobId;
use crate::error::QueueError;
use crate::job::Job;

/// Lifecycle notifications emitted by a queue.
///
/// Every successful job mutation emits exactly one of these after the change
/// has been persisted. Delivery is fire-and-forget over a broadcast channel.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Job was persisted for the first time
    Enqueue { job: Job },

    /// Job was claimed by a worker
    Start { job: Job },

    Progress { job: Job, progress: f64 },

    Log { job: Job },

    Priority { job: Job },

    Complete { job: Job, result: Value },

    Failure { job: Job, error: QueueError },

    Remove { job: Job },

    /// A queue-boundary operation failed
    Error { error: QueueError, job: Option<Job> },
}

impl QueueEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueue { .. } => "enqueue",
            Self::Start { .. } => "start",
            Self::Progress { .. } => "progress",
            Self::Log { .. } => "log",
            Self::Priority { .. } => "priority",
            Self::Complete { .. } => "complete",
            Self::Failure { .. } => "failure",
            Self::Remove { .. } => "remove",
            Self::Error { .. } => "error",
        }
    }

    /// The job the event is about, if any
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Enqueue { job }
            | Self::Start { job }
            | Self::Progress { job, .. }
            | Self::Log { job }
            | Self::Priority { job }
            | Self::Complete { job, .. }
            | Self::Failure { job, .. }
            | Self::Remove { job } => Some(job),
            Self::Error { job, .. } => job.as_ref(),
        }
    }

    /// Get the job ID from any event that carries a job
    pub fn job_id(&self) -> Option<&JobId> {
        self.job().map(Job::id)
    }
}
