use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use dog_jobs::store::{FindOptions, JobFilter, JobPatch};
use dog_jobs::{
    processor_fn, IdGenerator, JobError, JobId, JobRecord, JobState, JobStore, MemoryStore, NewJob,
    Priority, Queue, QueueConfig, QueueError, QueueEvent, StoreError, StoreResult, WorkerState,
};

/// Test factory functions
async fn create_test_queue() -> Queue {
    Queue::builder().store(MemoryStore::new()).build().await.unwrap()
}

async fn receive_next_event(rx: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Event receive error")
}

/// Skip events until one named `name` arrives
async fn wait_for_event(rx: &mut broadcast::Receiver<QueueEvent>, name: &str) -> QueueEvent {
    loop {
        let event = receive_next_event(rx).await;
        if event.event_name() == name {
            return event;
        }
    }
}

async fn wait_for_state(queue: &Queue, id: &JobId, state: JobState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(job) = queue.find_job(id).await.unwrap() {
                if job.state() == state {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for job state");
}

async fn wait_for_waiters(queue: &Queue, job_type: &str, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while queue.waiting_requests(job_type) < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("Timeout waiting for parked workers");
}

fn drain(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.event_name());
    }
    names
}

/// Memory store whose writes can be switched to fail
#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_writes: Arc<AtomicBool>,
    /// Number of upcoming updates that fail
    fail_next_updates: Arc<AtomicU32>,
}

impl FlakyStore {
    fn check(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn init(&self) -> StoreResult<()> {
        self.inner.init().await
    }

    async fn find(&self, filter: &JobFilter, options: &FindOptions) -> StoreResult<Vec<JobRecord>> {
        self.inner.find(filter, options).await
    }

    async fn find_one(&self, id: &JobId) -> StoreResult<Option<JobRecord>> {
        self.inner.find_one(id).await
    }

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64> {
        self.inner.count(filter).await
    }

    async fn insert(&self, record: JobRecord) -> StoreResult<JobRecord> {
        self.check()?;
        self.inner.insert(record).await
    }

    async fn update(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<u64> {
        self.check()?;
        let fail_this_one = self
            .fail_next_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_this_one {
            return Err(StoreError::Io("write interrupted".to_string()));
        }
        self.inner.update(filter, patch).await
    }

    async fn remove(&self, filter: &JobFilter) -> StoreResult<u64> {
        self.check()?;
        self.inner.remove(filter).await
    }
}

/// A1. Created jobs are persisted inactive and announced
#[tokio::test]
async fn test_create_job_persists_and_enqueues() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();

    // Act
    let job = queue
        .create_job(NewJob::new("email").with_payload(json!({ "to": "a@example.com" })))
        .await
        .unwrap();

    // Assert
    assert!(job.is_persisted());
    assert_eq!(job.state(), JobState::Inactive);
    assert_eq!(job.priority(), Priority::Normal);
    assert_eq!(job.payload()["to"], "a@example.com");

    let event = receive_next_event(&mut events).await;
    assert_eq!(event.event_name(), "enqueue");
    assert_eq!(event.job_id(), Some(job.id()));

    let stored = queue.find_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.state(), JobState::Inactive);
}

/// A2. Higher priority first, regardless of insertion order
#[tokio::test]
async fn test_priority_order_with_single_worker() {
    let queue = create_test_queue().await;

    // Arrange: LOW enqueued before CRITICAL, no worker yet
    let low = queue
        .create_job(NewJob::new("work").with_priority(Priority::Low))
        .await
        .unwrap();
    let critical = queue
        .create_job(NewJob::new("work").with_priority(Priority::Critical))
        .await
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();

    // Act
    queue.process(
        "work",
        processor_fn(move |job| {
            let seen = seen.clone();
            async move {
                seen.lock().push(job.id().clone());
                Ok(Value::Null)
            }
        }),
        1,
    );
    wait_for_state(&queue, low.id(), JobState::Complete).await;

    // Assert
    assert_eq!(*order.lock(), vec![critical.id().clone(), low.id().clone()]);
    queue.shutdown(Duration::from_secs(1), None).await;
}

/// A3. A parked worker receives a new job without any lookup by the producer
#[tokio::test]
async fn test_waiting_worker_receives_new_job() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();

    queue.process("work", processor_fn(|_job| async { Ok(json!("done")) }), 1);
    wait_for_waiters(&queue, "work", 1).await;

    // Act
    let job = queue.create_job(NewJob::new("work")).await.unwrap();

    // Assert: enqueue, start, complete in that order
    assert_eq!(receive_next_event(&mut events).await.event_name(), "enqueue");
    assert_eq!(receive_next_event(&mut events).await.event_name(), "start");
    match receive_next_event(&mut events).await {
        QueueEvent::Complete { job: completed, result } => {
            assert_eq!(completed.id(), job.id());
            assert_eq!(result, json!("done"));
            assert_eq!(completed.state(), JobState::Complete);
        }
        other => panic!("unexpected event {:?}", other),
    }
    queue.shutdown(Duration::from_secs(1), None).await;
}

/// A4. Many workers never process the same job twice
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claim_under_concurrency() {
    let queue = create_test_queue().await;
    let processed = Arc::new(Mutex::new(Vec::new()));
    let seen = processed.clone();

    queue.process(
        "work",
        processor_fn(move |job| {
            let seen = seen.clone();
            async move {
                seen.lock().push(job.id().clone());
                tokio::task::yield_now().await;
                Ok(Value::Null)
            }
        }),
        8,
    );

    let mut ids = Vec::new();
    for i in 0..50 {
        let job = queue
            .create_job(NewJob::new("work").with_payload(json!(i)))
            .await
            .unwrap();
        ids.push(job.id().clone());
    }

    for id in &ids {
        wait_for_state(&queue, id, JobState::Complete).await;
    }

    let processed = processed.lock().clone();
    let unique: HashSet<_> = processed.iter().cloned().collect();
    assert_eq!(processed.len(), 50);
    assert_eq!(unique.len(), 50);
    queue.shutdown(Duration::from_secs(1), None).await;
}

/// A5. Processor errors fail the job with the processor's message
#[tokio::test]
async fn test_processor_error_fails_job() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();
    queue.process(
        "work",
        processor_fn(|_job| async { Err(JobError::failed("boom")) }),
        1,
    );

    let job = queue.create_job(NewJob::new("work")).await.unwrap();

    match wait_for_event(&mut events, "failure").await {
        QueueEvent::Failure { job: failed, error } => {
            assert_eq!(failed.id(), job.id());
            assert_eq!(error.to_string(), "boom");
            assert!(failed.failed_at().is_some());
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_for_state(&queue, job.id(), JobState::Failure).await;
    queue.shutdown(Duration::from_secs(1), None).await;
}

/// A6. A panicking processor is recorded as a generic failure
#[tokio::test]
async fn test_processor_panic_is_normalized() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();
    queue.process(
        "work",
        processor_fn(|job| async move {
            if job.payload().is_null() {
                panic!("not an error value");
            }
            Ok(Value::Null)
        }),
        1,
    );

    queue.create_job(NewJob::new("work")).await.unwrap();

    match wait_for_event(&mut events, "failure").await {
        QueueEvent::Failure { error, .. } => {
            assert!(matches!(error, QueueError::Processor(JobError::NonError)));
            assert_eq!(
                error.to_string(),
                "Processor is failed, and non error object is thrown."
            );
        }
        other => panic!("unexpected event {:?}", other),
    }

    // The worker survives the panic
    let next = queue
        .create_job(NewJob::new("work").with_payload(json!(1)))
        .await
        .unwrap();
    wait_for_state(&queue, next.id(), JobState::Complete).await;
    queue.shutdown(Duration::from_secs(1), None).await;
}

/// A7. Shutting down idle workers resolves immediately
#[tokio::test]
async fn test_shutdown_idle_workers() {
    let queue = create_test_queue().await;
    let workers = queue.process("work", processor_fn(|_job| async { Ok(Value::Null) }), 3);
    wait_for_waiters(&queue, "work", 3).await;
    assert!(workers.iter().all(|w| w.state() == WorkerState::Running));

    tokio::time::timeout(Duration::from_millis(500), queue.shutdown(Duration::from_secs(60), None))
        .await
        .expect("idle shutdown should not wait for the timeout");

    assert!(queue.workers().is_empty());
    assert_eq!(queue.waiting_requests("work"), 0);
    assert!(workers.iter().all(|w| !w.is_running()));

    // Jobs created after shutdown stay inactive
    let job = queue.create_job(NewJob::new("work")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stored = queue.find_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.state(), JobState::Inactive);
}

/// A8. Shutdown waits for the in-flight job and drops its late result
#[tokio::test]
async fn test_shutdown_waits_for_in_flight_job() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();
    let started = Arc::new(Notify::new());
    let signal = started.clone();
    queue.process(
        "work",
        processor_fn(move |_job| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("finished"))
            }
        }),
        1,
    );
    let job = queue.create_job(NewJob::new("work")).await.unwrap();
    started.notified().await;

    // Act: resolves once the processor returns, well before the timeout
    tokio::time::timeout(
        Duration::from_secs(2),
        queue.shutdown(Duration::from_secs(10), None),
    )
    .await
    .expect("shutdown should resolve when the job finishes");

    // Assert: neither completed nor failed
    let stored = queue.find_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.state(), JobState::Active);
    assert!(stored.completed_at().is_none());
    assert!(stored.failed_at().is_none());
    let names = drain(&mut events);
    assert!(!names.contains(&"complete"));
    assert!(!names.contains(&"failure"));
}

/// A9. A job outliving the shutdown window is failed and stays failed
#[tokio::test]
async fn test_shutdown_timeout_fails_job_and_ignores_late_result() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let late_log_rejected = Arc::new(AtomicBool::new(false));

    let (s, r, rejected) = (started.clone(), release.clone(), late_log_rejected.clone());
    let workers = queue.process(
        "work",
        processor_fn(move |job| {
            let (s, r, rejected) = (s.clone(), r.clone(), rejected.clone());
            async move {
                s.notify_one();
                r.notified().await;
                if let Err(QueueError::JobAbandoned(_)) = job.add_log("late").await {
                    rejected.store(true, Ordering::SeqCst);
                }
                Ok(json!("too late"))
            }
        }),
        1,
    );
    let job = queue.create_job(NewJob::new("work")).await.unwrap();
    started.notified().await;
    assert_eq!(workers[0].current_job().map(|j| j.id().clone()), Some(job.id().clone()));

    // Act
    queue.shutdown(Duration::from_millis(30), None).await;

    // Assert: forced failure
    match wait_for_event(&mut events, "failure").await {
        QueueEvent::Failure { error, .. } => assert_eq!(error.to_string(), "shutdown timeout"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(workers[0].current_job().is_none());

    // The abandoned processor finishes later without touching the job
    release.notify_one();
    tokio::time::timeout(Duration::from_secs(1), async {
        while workers[0].state() != WorkerState::Stopped {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("worker loop should exit");

    assert!(late_log_rejected.load(Ordering::SeqCst));
    let stored = queue.find_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.state(), JobState::Failure);
    assert!(stored.logs().is_empty());
    assert!(stored.completed_at().is_none());
    assert!(!drain(&mut events).contains(&"complete"));
}

/// A10. Removing an unknown id fails and emits nothing else
#[tokio::test]
async fn test_remove_unknown_job() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();

    let err = queue.remove_job_by_id(&JobId::from("missing")).await.unwrap_err();

    assert!(matches!(err, QueueError::NotFound(ref id) if id.as_str() == "missing"));
    assert_eq!(err.to_string(), "Job(id:missing) is not found.");
    assert!(drain(&mut events).is_empty());
}

/// A11. Removal by id and by predicate
#[tokio::test]
async fn test_remove_jobs() {
    let queue = create_test_queue().await;
    let keep = queue.create_job(NewJob::new("keep")).await.unwrap();
    let drop_a = queue.create_job(NewJob::new("drop")).await.unwrap();
    let drop_b = queue.create_job(NewJob::new("drop")).await.unwrap();
    let by_id = queue.create_job(NewJob::new("keep")).await.unwrap();
    let mut events = queue.subscribe();

    queue.remove_job_by_id(by_id.id()).await.unwrap();
    let removed = queue
        .remove_jobs_by_callback(|job| job.job_type() == "drop")
        .await
        .unwrap();

    let removed_ids: HashSet<_> = removed.iter().map(|j| j.id().clone()).collect();
    assert_eq!(removed_ids, HashSet::from([drop_a.id().clone(), drop_b.id().clone()]));
    assert_eq!(drain(&mut events), vec!["remove", "remove", "remove"]);

    let remaining = queue.list_jobs(None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), keep.id());
}

/// A12. Listing is oldest first and filterable by state
#[tokio::test]
async fn test_list_jobs_order_and_filter() {
    let queue = create_test_queue().await;
    let mut created = Vec::new();
    for p in [Priority::Critical, Priority::Low, Priority::High] {
        created.push(queue.create_job(NewJob::new("t").with_priority(p)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let listed: Vec<_> = queue
        .list_jobs(None)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id().clone())
        .collect();
    let expected: Vec<_> = created.iter().map(|j| j.id().clone()).collect();
    assert_eq!(listed, expected);

    assert_eq!(queue.list_jobs(Some(JobState::Inactive)).await.unwrap().len(), 3);
    assert!(queue.list_jobs(Some(JobState::Active)).await.unwrap().is_empty());
}

/// A13. A job deleted while processing is not completed
#[tokio::test]
async fn test_result_of_removed_job_is_dropped() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();
    let q = queue.clone();
    queue.process(
        "work",
        processor_fn(move |job| {
            let q = q.clone();
            async move {
                q.remove_job_by_id(job.id())
                    .await
                    .map_err(|e| JobError::failed(e.to_string()))?;
                Ok(Value::Null)
            }
        }),
        1,
    );

    let job = queue.create_job(NewJob::new("work")).await.unwrap();
    wait_for_event(&mut events, "remove").await;
    queue.shutdown(Duration::from_secs(1), None).await;

    assert!(queue.find_job(job.id()).await.unwrap().is_none());
    let rest = drain(&mut events);
    assert!(!rest.contains(&"complete"));
    assert!(!rest.contains(&"error"));
}

/// A14. Shutdown can target one job type
#[tokio::test]
async fn test_shutdown_by_type() {
    let queue = create_test_queue().await;
    queue.process("a", processor_fn(|_job| async { Ok(Value::Null) }), 2);
    queue.process("b", processor_fn(|_job| async { Ok(Value::Null) }), 1);
    wait_for_waiters(&queue, "a", 2).await;
    wait_for_waiters(&queue, "b", 1).await;

    queue.shutdown(Duration::from_secs(1), Some("a")).await;

    let remaining = queue.workers();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].job_type(), "b");

    let job = queue.create_job(NewJob::new("b")).await.unwrap();
    wait_for_state(&queue, job.id(), JobState::Complete).await;
    queue.shutdown(Duration::from_secs(1), None).await;
}

/// A15. Store failures are returned and emitted with the job
#[tokio::test]
async fn test_store_errors_are_emitted_with_job() {
    let store = FlakyStore::default();
    let queue = Queue::builder().store(store.clone()).build().await.unwrap();
    let job = queue.create_job(NewJob::new("t")).await.unwrap();
    let mut events = queue.subscribe();

    store.fail_writes.store(true, Ordering::SeqCst);
    let err = job.set_priority(Priority::High).await.unwrap_err();

    assert!(matches!(err, QueueError::Store(StoreError::Io(_))));
    match receive_next_event(&mut events).await {
        QueueEvent::Error { error, job: Some(failed) } => {
            assert!(matches!(error, QueueError::Store(_)));
            assert_eq!(failed.id(), job.id());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(drain(&mut events).is_empty());
    assert_eq!(queue.metrics().errors(), 1);
}

/// A16. Failed inserts never reach a waiting worker
#[tokio::test]
async fn test_failed_insert_is_not_dispatched() {
    let store = FlakyStore::default();
    let queue = Queue::builder().store(store.clone()).build().await.unwrap();
    queue.process("t", processor_fn(|_job| async { Ok(Value::Null) }), 1);
    wait_for_waiters(&queue, "t", 1).await;

    store.fail_writes.store(true, Ordering::SeqCst);
    assert!(queue.create_job(NewJob::new("t")).await.is_err());

    assert_eq!(queue.waiting_requests("t"), 1);
    store.fail_writes.store(false, Ordering::SeqCst);
    queue.shutdown(Duration::from_secs(1), None).await;
}

/// A17. Jobs left active by a dead process are failed at startup
#[tokio::test]
async fn test_crash_recovery_fails_active_jobs() {
    // Arrange: a store with one ACTIVE and one INACTIVE record
    let store = MemoryStore::new();
    let mut active = JobRecord::new(JobId::from("crashed"), "work", Priority::Normal, Value::Null);
    active.state = JobState::Active;
    active.started_at = Some(active.created_at);
    store.insert(active).await.unwrap();
    store
        .insert(JobRecord::new(JobId::from("pending"), "work", Priority::Normal, Value::Null))
        .await
        .unwrap();

    // Act
    let builder = Queue::builder().store(store.clone());
    let mut events = builder.subscribe();
    let queue = builder.build().await.unwrap();

    // Assert
    match receive_next_event(&mut events).await {
        QueueEvent::Failure { job, error } => {
            assert_eq!(job.id().as_str(), "crashed");
            assert_eq!(error.to_string(), "unexpectedly termination");
        }
        other => panic!("unexpected event {:?}", other),
    }
    let crashed = queue.find_job(&JobId::from("crashed")).await.unwrap().unwrap();
    assert_eq!(crashed.state(), JobState::Failure);
    let pending = queue.find_job(&JobId::from("pending")).await.unwrap().unwrap();
    assert_eq!(pending.state(), JobState::Inactive);
}

/// A18. Injected id generator
#[tokio::test]
async fn test_injected_id_generator() {
    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    let queue = Queue::builder()
        .store(MemoryStore::new())
        .id_generator(IdGenerator::new(move || {
            format!("job-{}", c.fetch_add(1, Ordering::SeqCst))
        }))
        .build()
        .await
        .unwrap();

    let a = queue.create_job(NewJob::new("t")).await.unwrap();
    let b = queue.create_job(NewJob::new("t")).await.unwrap();

    assert_eq!(a.id().as_str(), "job-0");
    assert_eq!(b.id().as_str(), "job-1");
}

/// A19. Progress and logs reported from inside a processor
#[tokio::test]
async fn test_progress_and_logs_from_processor() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();
    queue.process(
        "work",
        processor_fn(|job| async move {
            let report = |e: QueueError| JobError::failed(e.to_string());
            job.add_log("step 1").await.map_err(report)?;
            job.set_progress(1, 2).await.map_err(report)?;
            job.set_progress(5, 2).await.map_err(report)?;
            Ok(Value::Null)
        }),
        1,
    );

    let job = queue.create_job(NewJob::new("work")).await.unwrap();
    wait_for_state(&queue, job.id(), JobState::Complete).await;
    queue.shutdown(Duration::from_secs(1), None).await;

    let stored = queue.find_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.logs(), vec!["step 1".to_string()]);
    assert_eq!(stored.progress(), Some(100.0));
    assert!(stored.duration().is_some());

    let names = drain(&mut events);
    assert_eq!(
        names,
        vec!["enqueue", "start", "log", "progress", "progress", "complete"]
    );
}

/// A20. Metrics follow the emitted events
#[tokio::test]
async fn test_metrics_track_lifecycle() {
    let queue = create_test_queue().await;
    queue.process(
        "ok",
        processor_fn(|_job| async { Ok(Value::Null) }),
        1,
    );
    queue.process(
        "bad",
        processor_fn(|_job| async { Err(JobError::failed("nope")) }),
        1,
    );

    let ok = queue.create_job(NewJob::new("ok")).await.unwrap();
    let bad = queue.create_job(NewJob::new("bad")).await.unwrap();
    wait_for_state(&queue, ok.id(), JobState::Complete).await;
    wait_for_state(&queue, bad.id(), JobState::Failure).await;
    queue.shutdown(Duration::from_secs(1), None).await;

    let metrics = queue.metrics();
    assert_eq!(metrics.jobs_enqueued(), 2);
    assert_eq!(metrics.jobs_started(), 2);
    assert_eq!(metrics.jobs_completed(), 1);
    assert_eq!(metrics.jobs_failed(), 1);
    let bad_metrics = metrics.job_type_metrics("bad").unwrap();
    assert_eq!(bad_metrics.success_rate(), 0.0);
    assert_eq!(bad_metrics.in_flight(), 0);
}

/// A21. The event stream yields the same lifecycle as the receiver
#[tokio::test]
async fn test_event_stream() {
    use tokio_stream::StreamExt;

    let queue = create_test_queue().await;
    let mut stream = queue.event_stream();

    let job = queue.create_job(NewJob::new("t")).await.unwrap();
    job.set_priority(Priority::High).await.unwrap();
    job.remove().await.unwrap();

    let mut names = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("Timeout waiting for stream event")
            .expect("stream ended");
        assert_eq!(event.job_id(), Some(job.id()));
        names.push(event.event_name());
    }
    assert_eq!(names, vec!["enqueue", "priority", "remove"]);
}

/// A22. Edits through the producer's handle never make a claimed job claimable again
#[tokio::test]
async fn test_producer_edit_does_not_release_claimed_job() {
    let queue = create_test_queue().await;
    let mut events = queue.subscribe();
    let runs = Arc::new(AtomicU32::new(0));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let worker_for = |runs: Arc<AtomicU32>, started: Arc<Notify>, release: Arc<Notify>| {
        processor_fn(move |_job| {
            let (runs, started, release) = (runs.clone(), started.clone(), release.clone());
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                started.notify_one();
                release.notified().await;
                Ok(Value::Null)
            }
        })
    };

    queue.process("t", worker_for(runs.clone(), started.clone(), release.clone()), 1);
    let job = queue.create_job(NewJob::new("t")).await.unwrap();
    started.notified().await;

    // Act: the producer still holds its INACTIVE snapshot
    job.set_priority(Priority::High).await.unwrap();
    queue.process("t", worker_for(runs.clone(), started.clone(), release.clone()), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    let stored = queue.find_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.state(), JobState::Active);
    assert_eq!(stored.priority(), Priority::High);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    release.notify_waiters();
    wait_for_state(&queue, job.id(), JobState::Complete).await;
    let starts = drain(&mut events).into_iter().filter(|n| *n == "start").count();
    assert_eq!(starts, 1);
    queue.shutdown(Duration::from_secs(1), None).await;
}

/// A23. A worker whose hand-off failed looks in the store again instead of
/// queueing behind the other parked workers
#[tokio::test]
async fn test_failed_hand_off_is_retried_from_store() {
    let store = FlakyStore::default();
    let queue = Queue::builder()
        .config(QueueConfig::default().with_error_backoff(Duration::from_millis(10)))
        .store(store.clone())
        .build()
        .await
        .unwrap();
    queue.process("sync", processor_fn(|_job| async { Ok(json!("synced")) }), 2);
    wait_for_waiters(&queue, "sync", 2).await;

    // Act: activating the handed-off job fails once
    store.fail_next_updates.store(1, Ordering::SeqCst);
    let job = queue.create_job(NewJob::new("sync")).await.unwrap();

    // Assert
    wait_for_state(&queue, job.id(), JobState::Complete).await;
    assert_eq!(store.fail_next_updates.load(Ordering::SeqCst), 0);
    queue.shutdown(Duration::from_secs(1), None).await;
}
