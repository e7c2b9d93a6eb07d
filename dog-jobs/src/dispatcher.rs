//! Exclusive claiming of inactive jobs for workers.
//!
//! The store offers no select-and-lock primitive, so every
//! "find an inactive job and mark it active" sequence and every
//! "insert a job and hand it to a waiter" sequence runs under one queue-wide
//! async mutex. Workers that find nothing register a [`WaitingRequest`] and
//! are settled directly by the next insert of their job type.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, instrument, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::queue::QueueShared;
use crate::store::{FindOptions, JobFilter};
use crate::types::{JobState, QueueEvent};

/// Re-evaluated at settlement time; `false` means the requester no longer
/// wants a job (its worker is shutting down).
pub(crate) type StillWanted = Arc<dyn Fn() -> bool + Send + Sync>;

type Settlement = QueueResult<Option<Job>>;

struct WaitingRequest {
    tx: oneshot::Sender<Settlement>,
    still_wanted: StillWanted,
}

impl WaitingRequest {
    fn is_wanted(&self) -> bool {
        !self.tx.is_closed() && (self.still_wanted)()
    }
}

/// Per job type FIFO of parked requests
type PendingRequests = HashMap<String, VecDeque<WaitingRequest>>;

enum Registration {
    Parked(oneshot::Receiver<Settlement>),
    NotWanted,
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    claim: AsyncMutex<()>,
    pending: Mutex<PendingRequests>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the next inactive job of `job_type`, waiting for one to be
    /// inserted if none is available.
    ///
    /// Returns `Ok(None)` when `still_wanted` turned false before a job could
    /// be handed over.
    pub(crate) async fn request_job_for_processing(
        &self,
        queue: &Arc<QueueShared>,
        job_type: &str,
        still_wanted: StillWanted,
    ) -> QueueResult<Option<Job>> {
        self.request(queue, job_type, still_wanted, true).await
    }

    /// Like [`request_job_for_processing`](Self::request_job_for_processing)
    /// but always looks in the store before parking. Used after a failed
    /// claim, whose job may have been left INACTIVE while other requests
    /// were already parked.
    pub(crate) async fn retry_job_for_processing(
        &self,
        queue: &Arc<QueueShared>,
        job_type: &str,
        still_wanted: StillWanted,
    ) -> QueueResult<Option<Job>> {
        self.request(queue, job_type, still_wanted, false).await
    }

    #[instrument(skip(self, queue, still_wanted))]
    async fn request(
        &self,
        queue: &Arc<QueueShared>,
        job_type: &str,
        still_wanted: StillWanted,
        behind_parked: bool,
    ) -> QueueResult<Option<Job>> {
        // Requests already parked for this type are served first
        if behind_parked {
            let parked = {
                let mut pending = self.pending.lock();
                match pending.get_mut(job_type) {
                    Some(waiting) if !waiting.is_empty() => {
                        Some(Self::register(waiting, still_wanted.clone()))
                    }
                    _ => None,
                }
            };
            if let Some(registration) = parked {
                return Self::settle(registration).await;
            }
        }

        let guard = self.claim.lock().await;

        let filter = JobFilter::all()
            .with_type(job_type)
            .with_state(JobState::Inactive);
        let found = match queue.store.find(&filter, &FindOptions::claim_order()).await {
            Ok(found) => found,
            Err(err) => {
                let err = QueueError::from(err);
                queue.emit(QueueEvent::Error {
                    error: err.clone(),
                    job: None,
                });
                return Err(err);
            }
        };

        let Some(record) = found.into_iter().next() else {
            let registration = {
                let mut pending = self.pending.lock();
                let waiting = pending.entry(job_type.to_string()).or_default();
                Self::register(waiting, still_wanted)
            };
            drop(guard);
            debug!(job_type, "no inactive job, waiting for insert");
            return Self::settle(registration).await;
        };

        if !still_wanted() {
            debug!(job_type, job_id = %record.id, "claim no longer wanted, leaving job inactive");
            return Ok(None);
        }

        let job = Job::from_record(queue.clone(), record, true);
        job.activate().await?;
        drop(guard);

        Ok(Some(job))
    }

    /// Persist a new job and hand it to the first still-wanted waiter of its
    /// type, if any.
    #[instrument(skip(self, queue, job), fields(job_id = %job.id(), job_type = %job.job_type()))]
    pub(crate) async fn add_job(&self, queue: &Arc<QueueShared>, job: &Job) -> QueueResult<()> {
        let _guard = self.claim.lock().await;

        queue.insert_record(job).await?;
        job.mark_persisted();
        queue.emit(QueueEvent::Enqueue { job: job.clone() });

        let Some(request) = self.next_waiter(job.job_type()) else {
            return Ok(());
        };

        // The waiter gets its own handle, the producer keeps its snapshot
        let claimed = Job::from_record(queue.clone(), job.to_record(), true);
        match claimed.activate().await {
            Ok(()) => {
                if request.tx.send(Ok(Some(claimed))).is_err() {
                    warn!("waiting worker went away after hand-off");
                }
            }
            Err(err) => {
                let _ = request.tx.send(Err(err));
            }
        }
        Ok(())
    }

    /// Settle and drop every parked request of `job_type` that is no longer
    /// wanted.
    pub(crate) fn release_unwanted(&self, job_type: &str) -> usize {
        let released: VecDeque<WaitingRequest> = {
            let mut pending = self.pending.lock();
            let Some(waiting) = pending.get_mut(job_type) else {
                return 0;
            };
            let (keep, release): (VecDeque<_>, VecDeque<_>) =
                waiting.drain(..).partition(WaitingRequest::is_wanted);
            *waiting = keep;
            if waiting.is_empty() {
                pending.remove(job_type);
            }
            release
        };

        let count = released.len();
        for request in released {
            let _ = request.tx.send(Ok(None));
        }
        count
    }

    /// Number of parked requests for `job_type`
    pub(crate) fn waiting(&self, job_type: &str) -> usize {
        self.pending.lock().get(job_type).map_or(0, VecDeque::len)
    }

    fn register(waiting: &mut VecDeque<WaitingRequest>, still_wanted: StillWanted) -> Registration {
        // Checked under the pending lock so a concurrent `release_unwanted`
        // either sees this request or the requester sees its own shutdown.
        if !still_wanted() {
            return Registration::NotWanted;
        }
        let (tx, rx) = oneshot::channel();
        waiting.push_back(WaitingRequest { tx, still_wanted });
        Registration::Parked(rx)
    }

    async fn settle(registration: Registration) -> QueueResult<Option<Job>> {
        match registration {
            Registration::NotWanted => Ok(None),
            Registration::Parked(rx) => match rx.await {
                Ok(settlement) => settlement,
                Err(_) => Err(QueueError::Internal(
                    "waiting request dropped without settlement".to_string(),
                )),
            },
        }
    }

    fn next_waiter(&self, job_type: &str) -> Option<WaitingRequest> {
        let mut pending = self.pending.lock();
        let waiting = pending.get_mut(job_type)?;

        let mut found = None;
        while let Some(request) = waiting.pop_front() {
            if request.is_wanted() {
                found = Some(request);
                break;
            }
            let _ = request.tx.send(Ok(None));
        }
        if waiting.is_empty() {
            pending.remove(job_type);
        }
        found
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("Dispatcher")
            .field("waiting_types", &pending.keys().collect::<Vec<_>>())
            .finish()
    }
}
