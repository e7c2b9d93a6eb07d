use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::dispatcher::StillWanted;
use crate::error::{JobError, QueueError};
use crate::job::Job;
use crate::processor::Processor;
use crate::queue::QueueShared;

/// Observable lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, not started
    Idle,
    Running,
    /// Shutdown requested, loop not yet exited
    ShuttingDown,
    Stopped,
}

/// One consumption loop for one job type.
///
/// Cloning a worker yields another handle to the same loop.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    id: String,
    job_type: String,
    queue: Arc<QueueShared>,
    running: Arc<AtomicBool>,
    flight: Mutex<Flight>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// The job being processed and whoever waits for it to finish
#[derive(Default)]
struct Flight {
    current: Option<Job>,
    waiter: Option<oneshot::Sender<()>>,
}

impl Worker {
    pub(crate) fn new(queue: Arc<QueueShared>, job_type: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: Uuid::new_v4().to_string(),
                job_type: job_type.into(),
                queue,
                running: Arc::new(AtomicBool::new(false)),
                flight: Mutex::new(Flight::default()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn job_type(&self) -> &str {
        &self.inner.job_type
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// The job currently being processed, if any
    pub fn current_job(&self) -> Option<Job> {
        self.inner.flight.lock().current.clone()
    }

    pub fn state(&self) -> WorkerState {
        let task = self.inner.task.lock();
        match task.as_ref() {
            None => WorkerState::Idle,
            Some(_) if self.is_running() => WorkerState::Running,
            Some(handle) if handle.is_finished() => WorkerState::Stopped,
            Some(_) => WorkerState::ShuttingDown,
        }
    }

    /// Spawn the consumption loop. Starting a worker twice is a no-op.
    pub(crate) fn start(&self, processor: Arc<dyn Processor>) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            warn!("Worker {} already started", self.inner.id);
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            inner.run(processor).await;
        }));
    }

    /// Stop claiming jobs and wait up to `timeout` for the in-flight job.
    ///
    /// A result produced after this call is dropped without completing the
    /// job. If the job does not finish in time it is failed with
    /// [`QueueError::ShutdownTimeout`] and its handle is abandoned; the
    /// processor itself keeps running but can no longer touch the job.
    #[instrument(skip(self), fields(worker_id = %self.inner.id, job_type = %self.inner.job_type))]
    pub async fn shutdown(&self, timeout: Duration) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let released = inner.queue.dispatcher.release_unwanted(&inner.job_type);
        if released > 0 {
            debug!("Released {} waiting request(s)", released);
        }

        let done = {
            let mut flight = inner.flight.lock();
            if flight.current.is_none() {
                info!("Worker idle, shut down");
                return;
            }
            let (tx, rx) = oneshot::channel();
            flight.waiter = Some(tx);
            rx
        };

        if tokio::time::timeout(timeout, done).await.is_ok() {
            info!("Worker finished in-flight job, shut down");
            return;
        }

        let timed_out = {
            let mut flight = inner.flight.lock();
            flight.waiter = None;
            flight.current.take()
        };
        if let Some(job) = timed_out {
            warn!("Shutdown timeout after {:?}, failing job {}", timeout, job.id());
            if let Err(e) = job.force_fail(QueueError::ShutdownTimeout).await {
                // Lost the race against the job's own outcome
                debug!("Could not fail timed-out job {}: {}", job.id(), e);
            }
        }
    }
}

impl WorkerInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[instrument(skip_all, fields(worker_id = %self.id, job_type = %self.job_type))]
    async fn run(self: Arc<Self>, processor: Arc<dyn Processor>) {
        info!("Worker started");

        let mut retrying = false;
        while self.is_running() {
            let running = self.running.clone();
            let still_wanted: StillWanted = Arc::new(move || running.load(Ordering::SeqCst));

            let dispatcher = &self.queue.dispatcher;
            let claimed = if retrying {
                dispatcher
                    .retry_job_for_processing(&self.queue, &self.job_type, still_wanted)
                    .await
            } else {
                dispatcher
                    .request_job_for_processing(&self.queue, &self.job_type, still_wanted)
                    .await
            };

            let job = match claimed {
                Ok(Some(job)) => {
                    retrying = false;
                    job
                }
                Ok(None) => {
                    retrying = false;
                    continue;
                }
                Err(e) => {
                    error!("Error claiming job: {}", e);
                    retrying = true;
                    tokio::time::sleep(self.queue.config.error_backoff).await;
                    continue;
                }
            };

            let claimed = {
                let mut flight = self.flight.lock();
                if self.is_running() {
                    flight.current = Some(job.clone());
                    true
                } else {
                    false
                }
            };

            if !claimed {
                // Handed over while shutdown was starting; nobody will process it
                warn!("Job {} arrived after shutdown began", job.id());
                if let Err(e) = job.fail(QueueError::WorkerShutdown).await {
                    error!("Failed to release job {}: {}", job.id(), e);
                }
                break;
            }

            self.process(processor.as_ref(), &job).await;
            self.finish_flight(&job);
        }

        info!("Worker stopped");
    }

    async fn process(&self, processor: &dyn Processor, job: &Job) {
        debug!("Processing job {}", job.id());

        let outcome = AssertUnwindSafe(processor.process(job.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                // A shutdown in progress wins over a late success
                if !self.is_running() {
                    debug!("Dropping result of job {} after shutdown", job.id());
                    return;
                }
                match job.is_exist().await {
                    Ok(true) => match job.complete(result).await {
                        Ok(()) => info!("Job {} completed successfully", job.id()),
                        Err(e) => warn!("Failed to complete job {}: {}", job.id(), e),
                    },
                    Ok(false) => debug!("Job {} was removed while processing", job.id()),
                    Err(e) => error!("Failed to check job {}: {}", job.id(), e),
                }
            }
            Ok(Err(job_error)) => {
                warn!("Job {} failed: {}", job.id(), job_error);
                self.record_failure(job, QueueError::Processor(job_error)).await;
            }
            Err(_) => {
                error!("Processor panicked on job {}", job.id());
                self.record_failure(job, QueueError::Processor(JobError::NonError)).await;
            }
        }
    }

    async fn record_failure(&self, job: &Job, error: QueueError) {
        if let Err(e) = job.fail(error).await {
            warn!("Failed to record failure of job {}: {}", job.id(), e);
        }
    }

    fn finish_flight(&self, job: &Job) {
        let mut flight = self.flight.lock();
        if flight.current.as_ref() == Some(job) {
            flight.current = None;
        }
        if let Some(waiter) = flight.waiter.take() {
            let _ = waiter.send(());
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("job_type", &self.inner.job_type)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
