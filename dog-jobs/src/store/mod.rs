pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::error::StoreResult;
use crate::types::{JobId, JobRecord, JobState, Priority};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Persistence contract for job records.
///
/// Implementations only need to be a queryable document collection; the
/// queue builds exclusive claiming on top of it and never relies on a native
/// select-and-lock primitive.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Prepare the store for use (load datafiles, create directories)
    async fn init(&self) -> StoreResult<()>;

    /// Records matching `filter`, ordered and limited by `options`
    async fn find(&self, filter: &JobFilter, options: &FindOptions) -> StoreResult<Vec<JobRecord>>;

    async fn find_one(&self, id: &JobId) -> StoreResult<Option<JobRecord>>;

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64>;

    /// Insert a new record; fails with `DuplicateId` if the id exists
    async fn insert(&self, record: JobRecord) -> StoreResult<JobRecord>;

    /// Apply `patch` to every matching record, returning how many matched
    async fn update(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<u64>;

    /// Delete every matching record, returning how many were removed
    async fn remove(&self, filter: &JobFilter) -> StoreResult<u64>;
}

/// Equality filter over the indexed record fields. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub id: Option<JobId>,
    pub job_type: Option<String>,
    pub state: Option<JobState>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: JobId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.id.as_ref().map_or(true, |id| &record.id == id)
            && self.job_type.as_ref().map_or(true, |t| &record.job_type == t)
            && self.state.map_or(true, |s| record.state == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Priority,
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Highest priority first, oldest first within a priority
    pub fn claim_order() -> Self {
        Self {
            sort: vec![
                SortKey::desc(SortField::Priority),
                SortKey::asc(SortField::CreatedAt),
            ],
            limit: Some(1),
        }
    }

    pub fn oldest_first() -> Self {
        Self {
            sort: vec![SortKey::asc(SortField::CreatedAt)],
            limit: None,
        }
    }

    /// Compare two records by the configured sort keys
    pub fn compare(&self, a: &JobRecord, b: &JobRecord) -> Ordering {
        for key in &self.sort {
            let ord = match key.field {
                SortField::Priority => a.priority.cmp(&b.priority),
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            };
            let ord = match key.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Partial update: every `Some` field is written, `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub priority: Option<Priority>,
    pub state: Option<JobState>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub progress: Option<f64>,
    /// Replaces the whole log
    pub logs: Option<Vec<String>>,
    /// Appended after `logs` is applied
    pub append_log: Option<String>,
}

impl JobPatch {
    /// The fields a job owner may edit directly. Lifecycle fields are left
    /// out so an outdated snapshot can never move the state backwards.
    pub fn attributes(record: &JobRecord) -> Self {
        Self {
            priority: Some(record.priority),
            updated_at: Some(record.updated_at),
            progress: record.progress,
            logs: Some(record.logs.clone()),
            ..Self::default()
        }
    }

    /// The fields written by a state transition
    pub fn lifecycle(record: &JobRecord) -> Self {
        Self {
            state: Some(record.state),
            updated_at: Some(record.updated_at),
            started_at: record.started_at,
            completed_at: record.completed_at,
            failed_at: record.failed_at,
            duration: record.duration,
            ..Self::default()
        }
    }

    pub fn apply(&self, record: &mut JobRecord) {
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(at) = self.updated_at {
            record.updated_at = at;
        }
        if let Some(at) = self.started_at {
            record.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            record.completed_at = Some(at);
        }
        if let Some(at) = self.failed_at {
            record.failed_at = Some(at);
        }
        if let Some(duration) = self.duration {
            record.duration = Some(duration);
        }
        if let Some(progress) = self.progress {
            record.progress = Some(progress);
        }
        if let Some(logs) = &self.logs {
            record.logs = logs.clone();
        }
        if let Some(line) = &self.append_log {
            record.logs.push(line.clone());
        }
    }
}
