use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::QueueEvent;

/// Live counters fed by every event a queue emits
#[derive(Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_removed: AtomicU64,
    errors: AtomicU64,

    // Per-job-type metrics
    job_type_metrics: RwLock<HashMap<String, JobTypeMetrics>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, event: &QueueEvent) {
        let counter = match event {
            QueueEvent::Enqueue { .. } => &self.jobs_enqueued,
            QueueEvent::Start { .. } => &self.jobs_started,
            QueueEvent::Complete { .. } => &self.jobs_completed,
            QueueEvent::Failure { .. } => &self.jobs_failed,
            QueueEvent::Remove { .. } => &self.jobs_removed,
            QueueEvent::Error { .. } => &self.errors,
            QueueEvent::Progress { .. } | QueueEvent::Log { .. } | QueueEvent::Priority { .. } => {
                return
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let Some(job) = event.job() else {
            return;
        };
        let mut per_type = self.job_type_metrics.write();
        let metrics = per_type.entry(job.job_type().to_string()).or_default();
        match event {
            QueueEvent::Enqueue { .. } => metrics.enqueued += 1,
            QueueEvent::Start { .. } => metrics.started += 1,
            QueueEvent::Complete { .. } => metrics.completed += 1,
            QueueEvent::Failure { .. } => metrics.failed += 1,
            QueueEvent::Remove { .. } => metrics.removed += 1,
            _ => {}
        }
    }

    // Getters for global metrics
    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_started(&self) -> u64 {
        self.jobs_started.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_removed(&self) -> u64 {
        self.jobs_removed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Get metrics for a specific job type
    pub fn job_type_metrics(&self, job_type: &str) -> Option<JobTypeMetrics> {
        self.job_type_metrics.read().get(job_type).cloned()
    }

    /// Get all job type metrics
    pub fn all_job_type_metrics(&self) -> HashMap<String, JobTypeMetrics> {
        self.job_type_metrics.read().clone()
    }
}

/// Metrics for a specific job type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTypeMetrics {
    pub enqueued: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub removed: u64,
}

impl JobTypeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.completed + self.failed;
        if total_processed == 0 {
            100.0
        } else {
            (self.completed as f64 / total_processed as f64) * 100.0
        }
    }

    /// Claimed but not yet finished
    pub fn in_flight(&self) -> u64 {
        self.started.saturating_sub(self.completed + self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut m = JobTypeMetrics::new();
        assert_eq!(m.success_rate(), 100.0);

        m.completed = 3;
        m.failed = 1;
        assert_eq!(m.success_rate(), 75.0);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let m = JobTypeMetrics {
            started: 1,
            failed: 2,
            ..JobTypeMetrics::default()
        };
        assert_eq!(m.in_flight(), 0);
    }
}
