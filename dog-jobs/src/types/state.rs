use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Persisted and waiting for a worker
    Inactive,
    /// Claimed by exactly one worker
    Active,
    Complete,
    Failure,
}

impl JobState {
    /// Check if the job is in a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failure)
    }

    /// Whether `self -> next` is a legal lifecycle step
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (Self::Inactive, Self::Active) => true,
            (Self::Active, Self::Complete) => true,
            (Self::Inactive | Self::Active, Self::Failure) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "INACTIVE",
            Self::Active => "ACTIVE",
            Self::Complete => "COMPLETE",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
