//! # dog-jobs: embedded persistent job queue
//!
//! Producers enqueue typed jobs with a priority; workers registered per job
//! type pull them, run user processing code and record the outcome. Every
//! job is handed to exactly one worker, highest priority first and FIFO
//! within a priority, without polling the store.
//!
//! ```rust,no_run
//! use dog_jobs::prelude::*;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> QueueResult<()> {
//! let queue = Queue::create(QueueConfig::default().with_file_store("data/jobs.db")).await?;
//!
//! queue.process("email", processor_fn(|job| async move {
//!     job.set_progress(1, 2).await.map_err(|e| JobError::failed(e.to_string()))?;
//!     Ok(json!({ "sent_to": job.payload()["to"] }))
//! }), 4);
//!
//! queue
//!     .create_job(NewJob::new("email").with_priority(Priority::High).with_payload(json!({ "to": "ops@example.com" })))
//!     .await?;
//!
//! queue.shutdown(Duration::from_secs(10), None).await;
//! # Ok(())
//! # }
//! ```
//!
//! Jobs left ACTIVE by a process that died are failed with
//! "unexpectedly termination" when the queue is created again.

pub mod config;
pub mod error;
pub mod job;
pub mod observability;
pub mod processor;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

mod dispatcher;

use futures_core::Stream;
use std::pin::Pin;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

pub use config::{QueueConfig, StoreConfig};
pub use error::{JobError, QueueError, QueueResult, StoreError, StoreResult};
pub use job::Job;
pub use observability::{JobTypeMetrics, LiveMetrics};
pub use processor::{processor_fn, FnProcessor, ProcessResult, Processor};
pub use queue::{NewJob, Queue, QueueBuilder};
pub use store::{FileStore, JobStore, MemoryStore};
pub use types::{IdGenerator, JobId, JobRecord, JobState, Priority, QueueEvent};
pub use worker::{Worker, WorkerState};

pub mod prelude {
    pub use crate::{
        processor_fn, IdGenerator, Job, JobError, JobId, JobState, NewJob, Priority, Processor,
        Queue, QueueConfig, QueueError, QueueEvent, QueueResult, StoreConfig,
    };

    // Essential traits
    pub use async_trait::async_trait;
}
