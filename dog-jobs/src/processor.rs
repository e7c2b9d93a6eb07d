use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

use crate::error::JobError;
use crate::job::Job;

/// Result type for processors
pub type ProcessResult = Result<Value, JobError>;

/// User processing code for one job type.
///
/// Returning `Ok` completes the job with the returned value, returning `Err`
/// fails it. A panic fails the job with [`JobError::NonError`].
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: Job) -> ProcessResult;
}

/// A closure-based processor.
pub struct FnProcessor<F> {
    f: F,
}

impl<F, Fut> FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    async fn process(&self, job: Job) -> ProcessResult {
        (self.f)(job).await
    }
}

/// Wrap an async closure as a [`Processor`]
///
/// ```ignore
/// queue.process("email", processor_fn(|job| async move {
///     job.add_log("sending").await.map_err(|e| JobError::failed(e.to_string()))?;
///     Ok(serde_json::json!({ "sent": true }))
/// }), 4);
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    FnProcessor::new(f)
}
