//! Worker loop: claim, execute, report.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobforge_core::{QueueError, QueueResult, WorkerId};

use super::manager::QueueManager;
use super::registry::HandlerRegistry;
use super::store::JobStore;
use super::types::{ClaimFilter, FailureKind, Job, ReportOutcome};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Which jobs to claim. When `job_types` is unset and the registry has no
    /// patterns, the worker only claims the exact types it has handlers for.
    pub filter: ClaimFilter,
    /// Stop after this many jobs
    pub max_jobs: Option<u64>,
    /// Sleep when the queue is empty
    pub poll_interval: Duration,
    /// Sleep after a store error
    pub error_backoff: Duration,
    /// Release claims older than this while idle
    pub stale_after: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::for_current_process(),
            filter: ClaimFilter::any(),
            max_jobs: None,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            stale_after: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<WorkerId>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_stale_after(mut self, after: Duration) -> Self {
        self.stale_after = Some(after);
        self
    }
}

/// Observable lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    /// Polling for work
    Running = 0,
    /// Running a handler
    Executing = 1,
    /// Shutdown requested; finishing the current job
    Draining = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Executing,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub processed: u64,
    pub succeeded: u64,
    /// Every failed attempt, including those that dead-lettered
    pub failed: u64,
    pub dead_lettered: u64,
}

enum Report {
    Completed(serde_json::Value),
    Failed(String, FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Retrying,
    DeadLettered,
    /// The report could not be applied; the job is left to the store
    Unreported,
}

impl WorkerSummary {
    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Retrying => self.failed += 1,
            Outcome::DeadLettered => {
                self.failed += 1;
                self.dead_lettered += 1;
            }
            Outcome::Unreported => {}
        }
    }
}

/// A single worker: claims jobs one at a time and runs them to completion.
///
/// Shutdown is cooperative. Cancelling the token stops polling immediately;
/// a job that is already executing is allowed to finish and is reported
/// before [`Worker::run`] returns.
pub struct Worker<S: JobStore> {
    manager: Arc<QueueManager<S>>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    cancel: CancellationToken,
    state: AtomicU8,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(
        manager: Arc<QueueManager<S>>,
        registry: Arc<HandlerRegistry>,
        mut config: WorkerConfig,
    ) -> Self {
        if config.filter.job_types.is_none() && !registry.has_patterns() && !registry.is_empty() {
            config.filter.job_types = Some(registry.job_types());
        }
        Self {
            manager,
            registry,
            config,
            cancel: CancellationToken::new(),
            state: AtomicU8::new(WorkerState::Running as u8),
        }
    }

    /// Use an externally owned token, e.g. one cancelled on Ctrl-C.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run until cancelled or `max_jobs` is reached.
    pub async fn run(&self) -> WorkerSummary {
        let worker = &self.config.worker_id;
        info!(
            worker = %worker,
            queue = ?self.config.filter.queue,
            job_types = ?self.config.filter.job_types,
            max_jobs = ?self.config.max_jobs,
            "worker started"
        );

        let mut summary = WorkerSummary::default();
        self.set_state(WorkerState::Running);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.config.max_jobs.is_some_and(|max| summary.processed >= max) {
                info!(worker = %worker, processed = summary.processed, "max jobs reached");
                break;
            }

            match self.manager.dequeue(&self.config.filter, worker).await {
                Ok(Some(job)) => {
                    self.set_state(WorkerState::Executing);
                    summary.record(self.process(job).await);
                    if !self.cancel.is_cancelled() {
                        self.set_state(WorkerState::Running);
                    }
                }
                Ok(None) => {
                    self.release_stale().await;
                    self.idle(self.config.poll_interval).await;
                }
                Err(e) => {
                    error!(worker = %worker, error = %e, "failed to claim job");
                    self.idle(self.config.error_backoff).await;
                }
            }
        }

        self.set_state(WorkerState::Stopped);
        info!(
            worker = %worker,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            dead_lettered = summary.dead_lettered,
            "worker stopped"
        );
        summary
    }

    /// Sleep, waking early on cancellation.
    async fn idle(&self, duration: Duration) {
        select! {
            _ = tokio::time::sleep(duration) => {},
            _ = self.cancel.cancelled() => {},
        }
    }

    async fn release_stale(&self) {
        let Some(after) = self.config.stale_after else {
            return;
        };
        if let Err(e) = self.manager.release_stale(after).await {
            warn!(worker = %self.config.worker_id, error = %e, "failed to release stale claims");
        }
    }

    async fn process(&self, job: Job) -> Outcome {
        let worker = &self.config.worker_id;
        debug!(
            worker = %worker,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "claimed job"
        );

        let started = Instant::now();
        let result = match self.registry.resolve(&job.job_type) {
            Ok(handler) => {
                let task_job = job.clone();
                let mut task = tokio::spawn(async move { handler.execute(&task_job).await });
                let joined = select! {
                    biased;
                    joined = &mut task => joined,
                    _ = self.cancel.cancelled() => {
                        self.set_state(WorkerState::Draining);
                        info!(worker = %worker, job_id = %job.id, "shutdown requested, finishing current job");
                        task.await
                    }
                };
                match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err((e.to_string(), FailureKind::Retryable)),
                    Err(e) => Err((format!("handler panicked: {e}"), FailureKind::Retryable)),
                }
            }
            Err(e @ QueueError::UnknownType(_)) => Err((e.to_string(), FailureKind::Permanent)),
            Err(e) => Err((e.to_string(), FailureKind::Retryable)),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                let report = self.report(&job, Report::Completed(value)).await;
                self.log_report(&job, report, duration_ms, || {
                    info!(
                        worker = %worker,
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempt = job.attempts,
                        duration_ms,
                        "job completed"
                    );
                    Outcome::Succeeded
                })
            }
            Err((error, kind)) => {
                let report = self.report(&job, Report::Failed(error.clone(), kind)).await;
                let exhausted = kind == FailureKind::Permanent || job.attempts >= job.max_attempts;
                self.log_report(&job, report, duration_ms, || {
                    if exhausted {
                        error!(
                            worker = %worker,
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempt = job.attempts,
                            duration_ms,
                            error = %error,
                            "job dead-lettered"
                        );
                        Outcome::DeadLettered
                    } else {
                        warn!(
                            worker = %worker,
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempt = job.attempts,
                            max_attempts = job.max_attempts,
                            duration_ms,
                            error = %error,
                            "job failed, will retry"
                        );
                        Outcome::Retrying
                    }
                })
            }
        }
    }

    /// Deliver a report, retrying transient store errors every `error_backoff`.
    ///
    /// Once shutdown is requested one more attempt is made before giving up;
    /// the claim is then left for stale-claim release.
    async fn report(&self, job: &Job, report: Report) -> QueueResult<ReportOutcome> {
        let worker = &self.config.worker_id;
        loop {
            let sent = match &report {
                Report::Completed(value) => {
                    self.manager.mark_completed(job.id, worker, value.clone()).await
                }
                Report::Failed(error, kind) => {
                    self.manager.mark_failed(job.id, worker, error.as_str(), *kind).await
                }
            };
            match sent {
                Err(e) if e.is_transient() && !self.cancel.is_cancelled() => {
                    error!(
                        worker = %worker,
                        job_id = %job.id,
                        error = %e,
                        "failed to report job result, retrying"
                    );
                    self.idle(self.config.error_backoff).await;
                }
                other => return other,
            }
        }
    }

    fn log_report(
        &self,
        job: &Job,
        report: Result<ReportOutcome, QueueError>,
        duration_ms: u64,
        applied: impl FnOnce() -> Outcome,
    ) -> Outcome {
        let worker = &self.config.worker_id;
        match report {
            Ok(ReportOutcome::Applied) => applied(),
            Ok(ReportOutcome::Duplicate) => {
                debug!(worker = %worker, job_id = %job.id, "report already applied");
                Outcome::Unreported
            }
            Err(e @ (QueueError::InvalidState { .. } | QueueError::NotFound(_))) => {
                warn!(worker = %worker, job_id = %job.id, duration_ms, error = %e, "report rejected");
                Outcome::Unreported
            }
            Err(e) => {
                error!(worker = %worker, job_id = %job.id, duration_ms, error = %e, "failed to report job result");
                Outcome::Unreported
            }
        }
    }
}

impl<S: JobStore> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("state", &WorkerState::from_u8(self.state.load(Ordering::Acquire)))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::HandlerError;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{EnqueueOptions, JobStatus, RetryBackoff};

    fn manager() -> Arc<QueueManager<InMemoryJobStore>> {
        Arc::new(QueueManager::new(InMemoryJobStore::new().with_backoff(RetryBackoff::none())))
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id("test-worker")
            .with_poll_interval(Duration::from_millis(10))
            .with_error_backoff(Duration::from_millis(10))
    }

    async fn enqueue(manager: &QueueManager<InMemoryJobStore>, job_type: &str) -> jobforge_core::JobId {
        manager
            .enqueue(job_type, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn executes_successful_job() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("test", |job| Ok(serde_json::json!({"echo": job.id.as_i64()})));

        let id = enqueue(&manager, "test").await;
        let worker = Worker::new(manager.clone(), Arc::new(registry), config().with_max_jobs(1));
        let summary = worker.run().await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(worker.state(), WorkerState::Stopped);

        let job = manager.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(serde_json::json!({"echo": id.as_i64()})));
        assert_eq!(job.claimed_by, None);
    }

    #[tokio::test]
    async fn failing_handler_retries_then_dead_letters() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("test", |_| Err(HandlerError::new("test error")));

        let id = enqueue(&manager, "test").await;
        let worker = Worker::new(manager.clone(), Arc::new(registry), config().with_max_jobs(3));
        let summary = worker.run().await;

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.dead_lettered, 1);

        let job = manager.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error.as_deref(), Some("test error"));
    }

    #[tokio::test]
    async fn unknown_type_dead_letters_without_retry() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("known", |_| Ok(serde_json::json!({})));

        let id = enqueue(&manager, "send_fax").await;
        let worker = Worker::new(
            manager.clone(),
            Arc::new(registry),
            config().with_filter(ClaimFilter::any().job_types(["send_fax"])).with_max_jobs(1),
        );
        let summary = worker.run().await;

        assert_eq!(summary.dead_lettered, 1);
        let job = manager.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error.unwrap().contains("send_fax"));
    }

    #[tokio::test]
    async fn default_filter_skips_unhandled_types() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("known", |_| Ok(serde_json::json!({})));

        let foreign = enqueue(&manager, "someone_elses").await;
        let known = enqueue(&manager, "known").await;
        let worker = Worker::new(manager.clone(), Arc::new(registry), config().with_max_jobs(1));
        worker.run().await;

        assert_eq!(manager.get_status(known).await.unwrap().status, JobStatus::Completed);
        assert_eq!(manager.get_status(foreign).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn panicking_handler_is_reported_as_failure() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("boom", |_| panic!("handler blew up"));

        let id = manager
            .enqueue("boom", serde_json::json!({}), EnqueueOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        let worker = Worker::new(manager.clone(), Arc::new(registry), config().with_max_jobs(1));
        let summary = worker.run().await;

        assert_eq!(summary.dead_lettered, 1);
        let job = manager.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_worker() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("test", |_| Ok(serde_json::json!({})));

        let worker = Arc::new(Worker::new(
            manager,
            Arc::new(registry),
            config().with_poll_interval(Duration::from_secs(60)),
        ));
        let token = worker.cancellation_token();

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.state(), WorkerState::Running);

        token.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("worker should stop promptly")
            .unwrap();

        assert_eq!(summary, WorkerSummary::default());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl crate::jobs::registry::JobHandler for SlowHandler {
        async fn execute(&self, _job: &Job) -> Result<serde_json::Value, HandlerError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(serde_json::json!({"slow": true}))
        }
    }

    #[tokio::test]
    async fn shutdown_drains_the_current_job() {
        let manager = manager();
        let mut registry = HandlerRegistry::new();
        registry.register("slow", SlowHandler);

        let id = enqueue(&manager, "slow").await;
        let worker = Arc::new(Worker::new(manager.clone(), Arc::new(registry), config()));
        let token = worker.cancellation_token();

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(worker.state(), WorkerState::Executing);

        token.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(worker.state(), WorkerState::Draining);

        let summary = running.await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(manager.get_status(id).await.unwrap().status, JobStatus::Completed);
    }

    /// Store that fails the first few claims and reports with `StoreUnavailable`.
    struct FlakyStore {
        inner: InMemoryJobStore,
        claim_failures: AtomicU8,
        report_failures: AtomicU8,
    }

    impl FlakyStore {
        fn trip(counter: &AtomicU8) -> QueueResult<()> {
            let tripped = counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                Err(QueueError::store_unavailable("connection reset"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl JobStore for FlakyStore {
        async fn insert(&self, job: crate::jobs::types::NewJob) -> QueueResult<jobforge_core::JobId> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: jobforge_core::JobId) -> QueueResult<Option<Job>> {
            self.inner.get(id).await
        }

        async fn claim_next(&self, filter: &ClaimFilter, worker: &WorkerId) -> QueueResult<Option<Job>> {
            Self::trip(&self.claim_failures)?;
            self.inner.claim_next(filter, worker).await
        }

        async fn complete(
            &self,
            id: jobforge_core::JobId,
            worker: &WorkerId,
            result: serde_json::Value,
        ) -> QueueResult<ReportOutcome> {
            Self::trip(&self.report_failures)?;
            self.inner.complete(id, worker, result).await
        }

        async fn fail(
            &self,
            id: jobforge_core::JobId,
            worker: &WorkerId,
            error: String,
            kind: FailureKind,
        ) -> QueueResult<ReportOutcome> {
            Self::trip(&self.report_failures)?;
            self.inner.fail(id, worker, error, kind).await
        }

        async fn cancel(&self, id: jobforge_core::JobId) -> QueueResult<Job> {
            self.inner.cancel(id).await
        }

        async fn list(&self, filter: &crate::jobs::types::JobListFilter) -> QueueResult<Vec<Job>> {
            self.inner.list(filter).await
        }

        async fn retry_failed(&self, id: jobforge_core::JobId, extra_attempts: u32) -> QueueResult<Job> {
            self.inner.retry_failed(id, extra_attempts).await
        }

        async fn release_stale(&self, older_than: Duration) -> QueueResult<Vec<jobforge_core::JobId>> {
            self.inner.release_stale(older_than).await
        }

        async fn stats(&self, queue: Option<&str>) -> QueueResult<crate::jobs::types::QueueStats> {
            self.inner.stats(queue).await
        }
    }

    fn flaky_manager(claim_failures: u8, report_failures: u8) -> Arc<QueueManager<FlakyStore>> {
        Arc::new(QueueManager::new(FlakyStore {
            inner: InMemoryJobStore::new().with_backoff(RetryBackoff::none()),
            claim_failures: AtomicU8::new(claim_failures),
            report_failures: AtomicU8::new(report_failures),
        }))
    }

    #[tokio::test]
    async fn claim_errors_back_off_and_the_loop_keeps_going() {
        let manager = flaky_manager(2, 0);
        let mut registry = HandlerRegistry::new();
        registry.register_fn("test", |_| Ok(serde_json::json!({})));

        let id = manager
            .enqueue("test", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let worker = Worker::new(manager.clone(), Arc::new(registry), config().with_max_jobs(1));
        let summary = tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("worker should survive claim errors");

        assert_eq!(summary.succeeded, 1);
        assert_eq!(manager.get_status(id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn completion_report_is_retried_after_store_error() {
        let manager = flaky_manager(0, 1);
        let mut registry = HandlerRegistry::new();
        registry.register_fn("test", |_| Ok(serde_json::json!({"done": true})));

        let id = manager
            .enqueue("test", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let worker = Worker::new(manager.clone(), Arc::new(registry), config().with_max_jobs(1));
        let summary = tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("report should be retried");

        assert_eq!(summary.succeeded, 1);
        let job = manager.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.claimed_by, None);
        assert_eq!(job.result, Some(serde_json::json!({"done": true})));
    }

    #[tokio::test]
    async fn failure_report_is_retried_after_store_error() {
        let manager = flaky_manager(0, 2);
        let mut registry = HandlerRegistry::new();
        registry.register_fn("test", |_| Err(HandlerError::new("nope")));

        let id = manager
            .enqueue("test", serde_json::json!({}), EnqueueOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        let worker = Worker::new(manager.clone(), Arc::new(registry), config().with_max_jobs(1));
        let summary = worker.run().await;

        assert_eq!(summary.dead_lettered, 1);
        let job = manager.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.history.len(), 1);
    }
}
