use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{JobId, JobState, Priority};

/// Persisted form of a job, as written to and read from a
/// [`JobStore`](crate::store::JobStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(deserialize_with = "sanitized_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub state: JobState,
    /// Milliseconds between `started_at` and `completed_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl JobRecord {
    /// A fresh, inactive record
    pub fn new(id: JobId, job_type: impl Into<String>, priority: Priority, data: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_type: job_type.into(),
            priority,
            data,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            state: JobState::Inactive,
            duration: None,
            progress: None,
            logs: Vec::new(),
        }
    }
}

// Records written by older versions or edited by hand may carry a priority
// outside 1..=5; those load as Normal instead of failing the whole datafile.
fn sanitized_priority<'de, D>(deserializer: D) -> Result<Priority, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(Priority::sanitize(raw))
}
