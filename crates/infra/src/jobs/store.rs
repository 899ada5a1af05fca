//! Job storage abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};

use jobforge_core::{Clock, JobId, QueueError, QueueResult, SystemClock, WorkerId};

use super::types::{
    ClaimFilter, FailureKind, Job, JobListFilter, JobStatus, NewJob, QueueStats, ReportOutcome,
    RetryBackoff,
};

/// Error recorded when a stale claim is released.
pub const LEASE_EXPIRED_ERROR: &str = "worker lease expired";

/// Durable job storage.
///
/// The store is the only component allowed to change a job's `status`,
/// `attempts` or `claimed_by`. Every mutation that depends on the current
/// state must be atomic with respect to concurrent callers; in particular
/// `claim_next` selects and marks a job in one step so two callers can never
/// receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job and return its id.
    async fn insert(&self, job: NewJob) -> QueueResult<JobId>;

    /// Get a job by id.
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Atomically claim the best eligible job for `worker`.
    ///
    /// Eligible: `pending`, `available_at <= now`, matching `filter`.
    /// Order: lowest `priority`, then creation order.
    async fn claim_next(&self, filter: &ClaimFilter, worker: &WorkerId) -> QueueResult<Option<Job>>;

    /// Record a successful attempt by the worker holding the claim.
    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        result: serde_json::Value,
    ) -> QueueResult<ReportOutcome>;

    /// Record a failed attempt; retries or dead-letters depending on the budget.
    async fn fail(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: String,
        kind: FailureKind,
    ) -> QueueResult<ReportOutcome>;

    /// Cancel a `pending` job.
    async fn cancel(&self, id: JobId) -> QueueResult<Job>;

    /// List jobs, newest first.
    async fn list(&self, filter: &JobListFilter) -> QueueResult<Vec<Job>>;

    /// Move a dead-lettered job back to `pending` with `extra_attempts` more tries.
    async fn retry_failed(&self, id: JobId, extra_attempts: u32) -> QueueResult<Job>;

    /// Fail every job that has been `processing` for longer than `older_than`.
    async fn release_stale(&self, older_than: Duration) -> QueueResult<Vec<JobId>>;

    /// Aggregate counters for one queue, or all queues when `queue` is `None`.
    async fn stats(&self, queue: Option<&str>) -> QueueResult<QueueStats>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: NewJob) -> QueueResult<JobId> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        (**self).get(id).await
    }

    async fn claim_next(&self, filter: &ClaimFilter, worker: &WorkerId) -> QueueResult<Option<Job>> {
        (**self).claim_next(filter, worker).await
    }

    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        result: serde_json::Value,
    ) -> QueueResult<ReportOutcome> {
        (**self).complete(id, worker, result).await
    }

    async fn fail(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: String,
        kind: FailureKind,
    ) -> QueueResult<ReportOutcome> {
        (**self).fail(id, worker, error, kind).await
    }

    async fn cancel(&self, id: JobId) -> QueueResult<Job> {
        (**self).cancel(id).await
    }

    async fn list(&self, filter: &JobListFilter) -> QueueResult<Vec<Job>> {
        (**self).list(filter).await
    }

    async fn retry_failed(&self, id: JobId, extra_attempts: u32) -> QueueResult<Job> {
        (**self).retry_failed(id, extra_attempts).await
    }

    async fn release_stale(&self, older_than: Duration) -> QueueResult<Vec<JobId>> {
        (**self).release_stale(older_than).await
    }

    async fn stats(&self, queue: Option<&str>) -> QueueResult<QueueStats> {
        (**self).stats(queue).await
    }
}

/// Which report arrived for a job that is not held by the reporting worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReportKind {
    Complete,
    Fail,
}

/// Classify a report that did not match a live claim.
///
/// A repeat of a report that was already applied is a no-op. A pending job
/// only counts as an applied failure once it has been attempted. Anything
/// else (reporting on a cancelled or never-claimed job, or on a claim held by
/// another worker) is an illegal transition.
pub(crate) fn stale_report(job: &Job, kind: ReportKind) -> QueueResult<ReportOutcome> {
    match (kind, job.status) {
        (ReportKind::Complete, JobStatus::Completed) => Ok(ReportOutcome::Duplicate),
        (ReportKind::Fail, JobStatus::Failed) => Ok(ReportOutcome::Duplicate),
        (ReportKind::Fail, JobStatus::Pending) if job.attempts > 0 => Ok(ReportOutcome::Duplicate),
        (ReportKind::Complete, status) => {
            Err(QueueError::invalid_state(job.id, status.as_str(), "complete"))
        }
        (ReportKind::Fail, status) => Err(QueueError::invalid_state(job.id, status.as_str(), "fail")),
    }
}

/// Start of the UTC day containing `now`.
pub(crate) fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug, Default)]
struct InMemoryState {
    last_id: i64,
    jobs: BTreeMap<JobId, Job>,
}

/// In-memory job store for tests/dev and single-process deployments.
///
/// All mutations take the write lock, so select-and-mark in `claim_next` is
/// atomic.
#[derive(Debug)]
pub struct InMemoryJobStore {
    state: RwLock<InMemoryState>,
    clock: Arc<dyn Clock>,
    backoff: RetryBackoff,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(InMemoryState::default()),
            clock,
            backoff: RetryBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> QueueResult<RwLockReadGuard<'_, InMemoryState>> {
        self.state
            .read()
            .map_err(|_| QueueError::store_unavailable("in-memory job store lock poisoned"))
    }

    fn write(&self) -> QueueResult<RwLockWriteGuard<'_, InMemoryState>> {
        self.state
            .write()
            .map_err(|_| QueueError::store_unavailable("in-memory job store lock poisoned"))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> QueueResult<JobId> {
        let job = job.validate()?;
        let now = self.clock.now();
        let mut state = self.write()?;

        state.last_id += 1;
        let id = JobId::new(state.last_id);
        state.jobs.insert(id, Job::from_new(id, job, now));
        Ok(id)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn claim_next(&self, filter: &ClaimFilter, worker: &WorkerId) -> QueueResult<Option<Job>> {
        let now = self.clock.now();
        let mut state = self.write()?;

        // BTreeMap iterates in id order, so min_by_key keeps FIFO within a priority.
        let next = state
            .jobs
            .values()
            .filter(|j| j.is_claimable(now) && filter.matches(j))
            .min_by_key(|j| (j.priority, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            state.jobs.get_mut(&id).map(|job| {
                job.mark_processing(worker, now);
                job.clone()
            })
        }))
    }

    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        result: serde_json::Value,
    ) -> QueueResult<ReportOutcome> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        if !job.is_held_by(worker) {
            return stale_report(job, ReportKind::Complete);
        }

        job.mark_completed(result, now);
        Ok(ReportOutcome::Applied)
    }

    async fn fail(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: String,
        kind: FailureKind,
    ) -> QueueResult<ReportOutcome> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        if !job.is_held_by(worker) {
            return stale_report(job, ReportKind::Fail);
        }

        job.mark_failed(error, kind, &self.backoff, now);
        Ok(ReportOutcome::Applied)
    }

    async fn cancel(&self, id: JobId) -> QueueResult<Job> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        if !job.status.can_transition_to(JobStatus::Cancelled) {
            return Err(QueueError::invalid_state(id, job.status.as_str(), "cancel"));
        }

        job.mark_cancelled(now);
        Ok(job.clone())
    }

    async fn list(&self, filter: &JobListFilter) -> QueueResult<Vec<Job>> {
        let state = self.read()?;
        Ok(state
            .jobs
            .values()
            .rev()
            .filter(|j| {
                filter.status.is_none_or(|s| j.status == s)
                    && filter.queue.as_ref().is_none_or(|q| &j.queue == q)
            })
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn retry_failed(&self, id: JobId, extra_attempts: u32) -> QueueResult<Job> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        if job.status != JobStatus::Failed {
            return Err(QueueError::invalid_state(id, job.status.as_str(), "retry"));
        }

        job.requeue(extra_attempts, now);
        Ok(job.clone())
    }

    async fn release_stale(&self, older_than: Duration) -> QueueResult<Vec<JobId>> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut state = self.write()?;

        let mut released = Vec::new();
        for job in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|started| started <= cutoff);
            if stale {
                job.mark_failed(
                    LEASE_EXPIRED_ERROR.to_string(),
                    FailureKind::Retryable,
                    &self.backoff,
                    now,
                );
                released.push(job.id);
            }
        }
        Ok(released)
    }

    async fn stats(&self, queue: Option<&str>) -> QueueResult<QueueStats> {
        let now = self.clock.now();
        let day_start = start_of_day(now);
        let window_start = now - chrono::Duration::hours(24);
        let state = self.read()?;

        let mut stats = QueueStats::default();
        let mut workers = HashSet::new();
        let mut durations = Vec::new();

        for job in state.jobs.values() {
            if queue.is_some_and(|q| job.queue != q) {
                continue;
            }
            let finished = job.finished_at;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => {
                    stats.processing += 1;
                    if let Some(worker) = &job.claimed_by {
                        workers.insert(worker.clone());
                    }
                }
                JobStatus::Completed => {
                    if finished.is_some_and(|f| f >= day_start) {
                        stats.completed_today += 1;
                    }
                    if finished.is_some_and(|f| f >= window_start) {
                        if let Some(d) = job.processing_duration() {
                            durations.push(d.num_milliseconds().max(0) as u64);
                        }
                    }
                }
                JobStatus::Failed => {
                    if finished.is_some_and(|f| f >= window_start) {
                        stats.failed_last_24h += 1;
                    }
                }
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }

        stats.active_workers = workers.len() as u64;
        if !durations.is_empty() {
            let total: u64 = durations.iter().sum();
            stats.avg_duration_ms = Some(total as f64 / durations.len() as f64);
            stats.max_duration_ms = durations.iter().copied().max();
        }
        Ok(stats)
    }
}
