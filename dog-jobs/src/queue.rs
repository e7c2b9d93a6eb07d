use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::config::{QueueConfig, StoreConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::observability::LiveMetrics;
use crate::processor::Processor;
use crate::store::{FileStore, FindOptions, JobFilter, JobPatch, JobStore, MemoryStore};
use crate::types::{IdGenerator, JobId, JobRecord, JobState, Priority, QueueEvent};
use crate::worker::Worker;
use crate::BoxStream;

/// Everything a job, a worker and the dispatcher need from their queue.
pub(crate) struct QueueShared {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) config: QueueConfig,
    events: broadcast::Sender<QueueEvent>,
    metrics: Arc<LiveMetrics>,
    ids: IdGenerator,
}

impl QueueShared {
    pub(crate) fn emit(&self, event: QueueEvent) {
        self.metrics.record(&event);
        // No receivers is not an error
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: &QueueError, job: Option<&Job>) {
        self.emit(QueueEvent::Error {
            error: error.clone(),
            job: job.cloned(),
        });
    }

    fn to_job(self: &Arc<Self>, record: JobRecord) -> Job {
        Job::from_record(self.clone(), record, true)
    }

    pub(crate) async fn insert_record(&self, job: &Job) -> QueueResult<()> {
        match self.store.insert(job.to_record()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = QueueError::from(e);
                self.emit_error(&err, Some(job));
                Err(err)
            }
        }
    }

    /// Apply `patch` to the record `filter` selects; exactly one row must match.
    pub(crate) async fn update_record(
        &self,
        job: &Job,
        filter: &JobFilter,
        patch: &JobPatch,
    ) -> QueueResult<()> {
        let result = self
            .store
            .update(filter, patch)
            .await
            .map_err(QueueError::from)
            .and_then(|actual| match actual {
                1 => Ok(()),
                actual => Err(QueueError::UpdateConflict {
                    expected: 1,
                    actual,
                }),
            });

        if let Err(err) = &result {
            self.emit_error(err, Some(job));
        }
        result
    }

    pub(crate) async fn remove_record(&self, job: &Job) -> QueueResult<()> {
        match self.store.remove(&JobFilter::by_id(job.id().clone())).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = QueueError::from(e);
                self.emit_error(&err, Some(job));
                Err(err)
            }
        }
    }

    pub(crate) async fn record_exists(&self, job: &Job) -> QueueResult<bool> {
        match self.store.count(&JobFilter::by_id(job.id().clone())).await {
            Ok(count) => Ok(count == 1),
            Err(e) => {
                let err = QueueError::from(e);
                self.emit_error(&err, Some(job));
                Err(err)
            }
        }
    }

    async fn find_records(&self, filter: &JobFilter, options: &FindOptions) -> QueueResult<Vec<JobRecord>> {
        match self.store.find(filter, options).await {
            Ok(records) => Ok(records),
            Err(e) => {
                let err = QueueError::from(e);
                self.emit_error(&err, None);
                Err(err)
            }
        }
    }
}

/// What a producer supplies to create a job
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub priority: Option<Priority>,
    pub payload: Option<Value>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            priority: None,
            payload: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Builder for [`Queue`]
pub struct QueueBuilder {
    config: QueueConfig,
    store: Option<Arc<dyn JobStore>>,
    ids: IdGenerator,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueBuilder {
    fn new() -> Self {
        let config = QueueConfig::default();
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            config,
            store: None,
            ids: IdGenerator::default(),
            events,
        }
    }

    /// Replaces the configuration. Receivers obtained from
    /// [`subscribe`](Self::subscribe) before this call are detached.
    pub fn config(mut self, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        self.events = events;
        self.config = config;
        self
    }

    /// Use `store` instead of the one described by the configuration
    pub fn store(mut self, store: impl JobStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn shared_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Receive events from the start, including crash-recovery failures
    /// emitted by [`build`](Self::build).
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Initialize the store and fail every job left ACTIVE by a previous
    /// process before the queue is handed out.
    pub async fn build(self) -> QueueResult<Queue> {
        let store: Arc<dyn JobStore> = match self.store {
            Some(store) => store,
            None => match &self.config.store {
                StoreConfig::Memory => Arc::new(MemoryStore::new()),
                StoreConfig::File { path } => Arc::new(FileStore::new(path)),
            },
        };

        let shared = Arc::new(QueueShared {
            store,
            dispatcher: Dispatcher::new(),
            config: self.config,
            events: self.events,
            metrics: Arc::new(LiveMetrics::new()),
            ids: self.ids,
        });

        if let Err(e) = shared.store.init().await {
            let err = QueueError::from(e);
            shared.emit_error(&err, None);
            return Err(err);
        }

        let queue = Queue {
            shared,
            workers: Arc::new(Mutex::new(Vec::new())),
        };
        queue.recover_interrupted().await?;

        info!("Queue ready");
        Ok(queue)
    }
}

/// Embedded persistent job queue.
///
/// Cloning a queue yields another handle to the same store, workers and
/// event channel.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<QueueShared>,
    workers: Arc<Mutex<Vec<Worker>>>,
}

impl Queue {
    pub fn builder() -> QueueBuilder {
        QueueBuilder::new()
    }

    /// Build a queue from configuration alone
    pub async fn create(config: QueueConfig) -> QueueResult<Self> {
        Self::builder().config(config).build().await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> Arc<LiveMetrics> {
        self.shared.metrics.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Event stream for observability. Lagged events are skipped.
    pub fn event_stream(&self) -> BoxStream<QueueEvent> {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Event stream lagged: {}", e);
                None
            }
        });
        Box::pin(stream)
    }

    /// Number of workers parked waiting for a job of `job_type`
    pub fn waiting_requests(&self, job_type: &str) -> usize {
        self.shared.dispatcher.waiting(job_type)
    }

    /// Snapshot of the active workers
    pub fn workers(&self) -> Vec<Worker> {
        self.workers.lock().clone()
    }

    #[instrument(skip(self, new_job), fields(job_type = %new_job.job_type))]
    pub async fn create_job(&self, new_job: NewJob) -> QueueResult<Job> {
        let record = JobRecord::new(
            self.shared.ids.generate(),
            new_job.job_type,
            new_job.priority.unwrap_or_default(),
            new_job.payload.unwrap_or(Value::Null),
        );
        let job = Job::from_record(self.shared.clone(), record, false);
        job.save().await?;

        debug!("Created job {}", job.id());
        Ok(job)
    }

    /// Start `concurrency` workers for `job_type`
    pub fn process<P: Processor>(&self, job_type: &str, processor: P, concurrency: usize) -> Vec<Worker> {
        self.process_shared(job_type, Arc::new(processor), concurrency)
    }

    /// Like [`process`](Self::process) with the configured default concurrency
    pub fn process_default<P: Processor>(&self, job_type: &str, processor: P) -> Vec<Worker> {
        self.process(job_type, processor, self.shared.config.default_concurrency)
    }

    pub fn process_shared(
        &self,
        job_type: &str,
        processor: Arc<dyn Processor>,
        concurrency: usize,
    ) -> Vec<Worker> {
        let started: Vec<Worker> = (0..concurrency)
            .map(|_| {
                let worker = Worker::new(self.shared.clone(), job_type);
                worker.start(processor.clone());
                worker
            })
            .collect();

        self.workers.lock().extend(started.iter().cloned());
        info!("Started {} worker(s) for {}", concurrency, job_type);
        started
    }

    /// Shut down all workers, or only those of `job_type`, each bounded by
    /// `timeout`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration, job_type: Option<&str>) {
        let targets: Vec<Worker> = self
            .workers
            .lock()
            .iter()
            .filter(|w| job_type.map_or(true, |t| w.job_type() == t))
            .cloned()
            .collect();

        join_all(targets.iter().map(|w| w.shutdown(timeout))).await;

        self.workers.lock().retain(|w| !targets.contains(w));
        info!("Shut down {} worker(s)", targets.len());
    }

    /// Shut down every worker with the configured timeout
    pub async fn close(&self) {
        self.shutdown(self.shared.config.shutdown_timeout, None).await;
    }

    pub async fn find_job(&self, id: &JobId) -> QueueResult<Option<Job>> {
        match self.shared.store.find_one(id).await {
            Ok(record) => Ok(record.map(|r| self.shared.to_job(r))),
            Err(e) => {
                let err = QueueError::from(e);
                self.shared.emit_error(&err, None);
                Err(err)
            }
        }
    }

    /// Jobs ordered oldest first, optionally only those in `state`
    pub async fn list_jobs(&self, state: Option<JobState>) -> QueueResult<Vec<Job>> {
        let filter = JobFilter {
            state,
            ..JobFilter::default()
        };
        let records = self
            .shared
            .find_records(&filter, &FindOptions::oldest_first())
            .await?;
        Ok(records.into_iter().map(|r| self.shared.to_job(r)).collect())
    }

    #[instrument(skip(self))]
    pub async fn remove_job_by_id(&self, id: &JobId) -> QueueResult<()> {
        let Some(job) = self.find_job(id).await? else {
            return Err(QueueError::NotFound(id.clone()));
        };
        job.remove().await
    }

    /// Remove every job `predicate` selects, returning the removed jobs
    pub async fn remove_jobs_by_callback<F>(&self, predicate: F) -> QueueResult<Vec<Job>>
    where
        F: Fn(&Job) -> bool,
    {
        let mut removed = Vec::new();
        for job in self.list_jobs(None).await? {
            if predicate(&job) {
                job.remove().await?;
                removed.push(job);
            }
        }
        Ok(removed)
    }

    async fn recover_interrupted(&self) -> QueueResult<()> {
        let interrupted = self.list_jobs(Some(JobState::Active)).await?;
        if interrupted.is_empty() {
            return Ok(());
        }

        warn!("Failing {} job(s) interrupted by a previous shutdown", interrupted.len());
        for job in interrupted {
            job.fail(QueueError::UnexpectedTermination).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.shared.config)
            .field("workers", &self.workers.lock().len())
            .field("dispatcher", &self.shared.dispatcher)
            .finish()
    }
}

#[cfg(test)]
impl Queue {
    pub(crate) fn shared(&self) -> &Arc<QueueShared> {
        &self.shared
    }
}
