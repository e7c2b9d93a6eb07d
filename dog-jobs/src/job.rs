use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::queue::QueueShared;
use crate::store::{JobFilter, JobPatch};
use crate::types::{JobId, JobRecord, JobState, Priority, QueueEvent};

/// Handle to one unit of work owned by a [`Queue`](crate::Queue).
///
/// A `Job` is a snapshot of its record taken when the handle was created.
/// Mutating methods write through to the store first and emit exactly one
/// [`QueueEvent`] once the write succeeded. Clones share the same snapshot.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: JobId,
    job_type: String,
    payload: Value,
    created_at: DateTime<Utc>,
    queue: Arc<QueueShared>,
    slot: Mutex<Slot>,
    abandoned: AtomicBool,
}

struct Slot {
    record: JobRecord,
    persisted: bool,
}

impl Job {
    pub(crate) fn from_record(queue: Arc<QueueShared>, record: JobRecord, persisted: bool) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id: record.id.clone(),
                job_type: record.job_type.clone(),
                payload: record.data.clone(),
                created_at: record.created_at,
                queue,
                slot: Mutex::new(Slot { record, persisted }),
                abandoned: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.inner.id
    }

    pub fn job_type(&self) -> &str {
        &self.inner.job_type
    }

    /// Producer-defined payload
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn priority(&self) -> Priority {
        self.inner.slot.lock().record.priority
    }

    pub fn state(&self) -> JobState {
        self.inner.slot.lock().record.state
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.inner.slot.lock().record.updated_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.slot.lock().record.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.slot.lock().record.completed_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.slot.lock().record.failed_at
    }

    /// Milliseconds from start to completion
    pub fn duration(&self) -> Option<i64> {
        self.inner.slot.lock().record.duration
    }

    pub fn progress(&self) -> Option<f64> {
        self.inner.slot.lock().record.progress
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.slot.lock().record.logs.clone()
    }

    pub fn is_persisted(&self) -> bool {
        self.inner.slot.lock().persisted
    }

    /// True once the owning worker gave up on this job during shutdown
    pub fn is_abandoned(&self) -> bool {
        self.inner.abandoned.load(Ordering::SeqCst)
    }

    /// Copy of the current snapshot in its persisted form
    pub fn to_record(&self) -> JobRecord {
        self.inner.slot.lock().record.clone()
    }

    /// Report progress as `done` out of `total`, clamped to 100.
    pub async fn set_progress(&self, done: u64, total: u64) -> QueueResult<()> {
        if total == 0 {
            return Err(QueueError::InvalidProgress { done, total });
        }
        let progress = (done as f64 * 100.0 / total as f64).min(100.0);

        self.mutate(|record| {
            record.progress = Some(progress);
            JobPatch {
                progress: Some(progress),
                ..JobPatch::default()
            }
        })
        .await?;

        self.emit(QueueEvent::Progress {
            job: self.clone(),
            progress,
        });
        Ok(())
    }

    pub async fn add_log(&self, message: impl Into<String>) -> QueueResult<()> {
        let message = message.into();
        self.mutate(|record| {
            record.logs.push(message.clone());
            JobPatch {
                append_log: Some(message),
                ..JobPatch::default()
            }
        })
        .await?;

        self.emit(QueueEvent::Log { job: self.clone() });
        Ok(())
    }

    pub async fn set_priority(&self, priority: Priority) -> QueueResult<()> {
        self.mutate(|record| {
            record.priority = priority;
            JobPatch {
                priority: Some(priority),
                ..JobPatch::default()
            }
        })
        .await?;

        self.emit(QueueEvent::Priority { job: self.clone() });
        Ok(())
    }

    /// Insert the job if it was never persisted, otherwise write its mutable
    /// fields back to the store.
    pub async fn save(&self) -> QueueResult<Job> {
        self.ensure_usable()?;

        if self.is_persisted() {
            let patch = JobPatch::attributes(&self.to_record());
            self.inner.queue.update_record(self, &self.filter(), &patch).await?;
        } else {
            let queue = self.inner.queue.clone();
            queue.dispatcher.add_job(&queue, self).await?;
        }
        Ok(self.clone())
    }

    pub async fn remove(&self) -> QueueResult<()> {
        self.ensure_usable()?;
        self.inner.queue.remove_record(self).await?;

        self.emit(QueueEvent::Remove { job: self.clone() });
        Ok(())
    }

    pub async fn is_exist(&self) -> QueueResult<bool> {
        self.inner.queue.record_exists(self).await
    }

    pub(crate) fn mark_persisted(&self) {
        self.inner.slot.lock().persisted = true;
    }

    pub(crate) fn abandon(&self) {
        self.inner.abandoned.store(true, Ordering::SeqCst);
    }

    /// INACTIVE -> ACTIVE
    pub(crate) async fn activate(&self) -> QueueResult<()> {
        self.transition(JobState::Active, |record, now| {
            record.started_at = Some(now);
        })
        .await?;

        self.emit(QueueEvent::Start { job: self.clone() });
        Ok(())
    }

    /// ACTIVE -> COMPLETE
    pub(crate) async fn complete(&self, result: Value) -> QueueResult<()> {
        self.transition(JobState::Complete, |record, now| {
            record.completed_at = Some(now);
            if let Some(started_at) = record.started_at {
                record.duration = Some((now - started_at).num_milliseconds());
            }
        })
        .await?;

        self.emit(QueueEvent::Complete {
            job: self.clone(),
            result,
        });
        Ok(())
    }

    /// Any non-terminal state -> FAILURE
    pub(crate) async fn fail(&self, error: QueueError) -> QueueResult<()> {
        self.transition(JobState::Failure, |record, now| {
            record.failed_at = Some(now);
        })
        .await?;

        self.emit(QueueEvent::Failure {
            job: self.clone(),
            error,
        });
        Ok(())
    }

    /// Abandon the handle and record `error` as its failure. Later calls
    /// through any clone of this handle are rejected.
    pub(crate) async fn force_fail(&self, error: QueueError) -> QueueResult<()> {
        self.abandon();
        self.apply_transition(JobState::Failure, |record, now| {
            record.failed_at = Some(now);
        })
        .await?;

        self.emit(QueueEvent::Failure {
            job: self.clone(),
            error,
        });
        Ok(())
    }

    fn ensure_usable(&self) -> QueueResult<()> {
        if self.is_abandoned() {
            return Err(QueueError::JobAbandoned(self.inner.id.clone()));
        }
        Ok(())
    }

    fn filter(&self) -> JobFilter {
        JobFilter::by_id(self.inner.id.clone())
    }

    /// Apply `f` to the snapshot and write only the fields its patch names.
    async fn mutate<F>(&self, f: F) -> QueueResult<()>
    where
        F: FnOnce(&mut JobRecord) -> JobPatch,
    {
        self.ensure_usable()?;
        let patch = {
            let mut slot = self.inner.slot.lock();
            let mut patch = f(&mut slot.record);
            let now = next_timestamp(slot.record.updated_at);
            slot.record.updated_at = now;
            patch.updated_at = Some(now);
            patch
        };
        self.inner.queue.update_record(self, &self.filter(), &patch).await
    }

    async fn transition<F>(&self, next: JobState, f: F) -> QueueResult<()>
    where
        F: FnOnce(&mut JobRecord, DateTime<Utc>),
    {
        self.ensure_usable()?;
        self.apply_transition(next, f).await
    }

    async fn apply_transition<F>(&self, next: JobState, f: F) -> QueueResult<()>
    where
        F: FnOnce(&mut JobRecord, DateTime<Utc>),
    {
        let (previous, patch) = {
            let mut slot = self.inner.slot.lock();
            let current = slot.record.state;
            if !current.can_transition_to(next) {
                return Err(QueueError::InvalidTransition {
                    id: self.inner.id.clone(),
                    from: current,
                    to: next,
                });
            }
            let previous = slot.record.clone();
            let now = next_timestamp(slot.record.updated_at);
            slot.record.state = next;
            slot.record.updated_at = now;
            f(&mut slot.record, now);
            (previous, JobPatch::lifecycle(&slot.record))
        };

        debug!(job_id = %self.inner.id, job_type = %self.inner.job_type, state = %next, "job transition");
        // Matches nothing if the stored state moved on since this snapshot
        let filter = self.filter().with_state(previous.state);
        if let Err(err) = self.inner.queue.update_record(self, &filter, &patch).await {
            self.restore_lifecycle(&previous, next);
            return Err(err);
        }
        Ok(())
    }

    fn restore_lifecycle(&self, previous: &JobRecord, attempted: JobState) {
        let mut slot = self.inner.slot.lock();
        if slot.record.state != attempted {
            return;
        }
        slot.record.state = previous.state;
        slot.record.started_at = previous.started_at;
        slot.record.completed_at = previous.completed_at;
        slot.record.failed_at = previous.failed_at;
        slot.record.duration = previous.duration;
    }

    fn emit(&self, event: QueueEvent) {
        self.inner.queue.emit(event);
    }
}

/// `updated_at` never moves backwards, even if the wall clock does.
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("job_type", &self.inner.job_type)
            .field("priority", &slot.record.priority)
            .field("state", &slot.record.state)
            .field("persisted", &slot.persisted)
            .finish()
    }
}

impl PartialEq for Job {
    /// Handles are equal when they refer to the same job id
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
