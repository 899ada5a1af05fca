//! Producer/consumer facade over a [`JobStore`].

use std::sync::Arc;
use std::time::Duration;

use jobforge_core::{Clock, JobId, QueueError, QueueResult, SystemClock, WorkerId};
use tracing::{info, warn};

use super::store::JobStore;
use super::types::{
    ClaimFilter, EnqueueOptions, FailureKind, Job, JobListFilter, NewJob, QueueStats,
    ReportOutcome, DEFAULT_MAX_ATTEMPTS,
};

/// Entry point for producers, workers and operators.
///
/// Holds no state of its own beyond the injected store and clock.
#[derive(Debug)]
pub struct QueueManager<S: JobStore> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> QueueManager<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// The clock must be the one the store was built with, so delays and
    /// eligibility are measured against the same time source.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Enqueue a job; it becomes claimable after `options.delay_seconds`.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let delay = chrono::Duration::from_std(Duration::from_secs(options.delay_seconds))
            .map_err(|_| QueueError::validation("delay_seconds is out of range"))?;

        let available_at = self
            .clock
            .now()
            .checked_add_signed(delay)
            .ok_or_else(|| QueueError::validation("delay_seconds is out of range"))?;

        let mut job = NewJob::new(job_type, payload).available_at(available_at);
        if let Some(queue) = options.queue {
            job = job.with_queue(queue);
        }
        if let Some(priority) = options.priority {
            job = job.with_priority(priority);
        }
        if let Some(max_attempts) = options.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }

        let job_type = job.job_type.clone();
        let queue = job.queue.clone();
        let id = self.store.insert(job).await?;
        info!(
            job_id = %id,
            job_type = %job_type,
            queue = %queue,
            delay_seconds = options.delay_seconds,
            "job enqueued"
        );
        Ok(id)
    }

    /// Claim the next eligible job for `worker`, if any.
    pub async fn dequeue(&self, filter: &ClaimFilter, worker: &WorkerId) -> QueueResult<Option<Job>> {
        self.store.claim_next(filter, worker).await
    }

    pub async fn mark_completed(
        &self,
        id: JobId,
        worker: &WorkerId,
        result: serde_json::Value,
    ) -> QueueResult<ReportOutcome> {
        self.store.complete(id, worker, result).await
    }

    pub async fn mark_failed(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: impl Into<String>,
        kind: FailureKind,
    ) -> QueueResult<ReportOutcome> {
        self.store.fail(id, worker, error.into(), kind).await
    }

    pub async fn cancel(&self, id: JobId) -> QueueResult<Job> {
        let job = self.store.cancel(id).await?;
        info!(job_id = %id, job_type = %job.job_type, "job cancelled");
        Ok(job)
    }

    /// Current state of a job.
    pub async fn get_status(&self, id: JobId) -> QueueResult<Job> {
        self.store.get(id).await?.ok_or(QueueError::NotFound(id))
    }

    pub async fn stats(&self, queue: Option<&str>) -> QueueResult<QueueStats> {
        self.store.stats(queue).await
    }

    pub async fn list(&self, filter: &JobListFilter) -> QueueResult<Vec<Job>> {
        self.store.list(filter).await
    }

    /// Operator re-queue of a dead-lettered job with a fresh default budget.
    pub async fn retry_failed(&self, id: JobId) -> QueueResult<Job> {
        let job = self.store.retry_failed(id, DEFAULT_MAX_ATTEMPTS).await?;
        info!(
            job_id = %id,
            job_type = %job.job_type,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            "dead-lettered job re-queued"
        );
        Ok(job)
    }

    /// Return jobs abandoned by crashed workers to the queue.
    pub async fn release_stale(&self, older_than: Duration) -> QueueResult<Vec<JobId>> {
        let released = self.store.release_stale(older_than).await?;
        if !released.is_empty() {
            warn!(
                count = released.len(),
                older_than_secs = older_than.as_secs(),
                "released stale job claims"
            );
        }
        Ok(released)
    }
}
