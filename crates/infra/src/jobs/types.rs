//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{JobId, QueueError, QueueResult, WorkerId};

/// Queue used when the producer does not name one.
pub const DEFAULT_QUEUE: &str = "default";
/// Highest priority (claimed first).
pub const MIN_PRIORITY: i32 = 1;
/// Lowest priority.
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker and executing
    Processing,
    /// Completed successfully
    Completed,
    /// Exhausted its attempts (dead-lettered)
    Failed,
    /// Cancelled by a producer before it was claimed
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Transitions the queue itself may perform.
    ///
    /// `Failed -> Pending` is deliberately absent: only the explicit operator
    /// re-queue (`retry_failed`) moves a dead letter, never the worker path.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::validation(format!("unknown job status '{s}'")))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(QueueError::validation(format!(
                "unknown backoff strategy '{other}'"
            ))),
        }
    }
}

/// Delay applied before a failed job becomes claimable again.
///
/// The attempt budget lives on each job (`max_attempts`); this only shapes
/// the spacing between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryBackoff {
    /// Retry immediately.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    /// Calculate delay after a given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Key into the handler registry
    pub job_type: String,
    /// Opaque JSON object handed verbatim to the handler
    pub payload: serde_json::Value,
    /// Logical partition
    pub queue: String,
    /// Lower value is claimed first
    pub priority: i32,
    pub status: JobStatus,
    /// Execution attempts so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// Not claimable before this instant
    pub available_at: DateTime<Utc>,
    /// Worker holding the job while `processing`
    pub claimed_by: Option<WorkerId>,
    pub result: Option<serde_json::Value>,
    /// Last error reported for this job
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current (or last) attempt was claimed
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// One record per finished attempt
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub worker: Option<WorkerId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What a failure report did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Back to `pending`, claimable again at the given time
    Retry { available_at: DateTime<Utc> },
    /// Attempts exhausted; permanently `failed`
    DeadLettered,
}

impl Job {
    /// Build a pending job from validated input.
    pub(crate) fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: new.job_type,
            payload: new.payload,
            queue: new.queue,
            priority: new.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            available_at: new.available_at.max(now),
            claimed_by: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            history: Vec::new(),
        }
    }

    /// Whether the job can be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.available_at <= now
    }

    /// Whether `worker` currently holds the claim.
    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.status == JobStatus::Processing && self.claimed_by.as_ref() == Some(worker)
    }

    /// Time spent in the last attempt, once it finished.
    pub fn processing_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }

    pub(crate) fn mark_processing(&mut self, worker: &WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.claimed_by = Some(worker.clone());
        self.started_at = Some(now);
        self.finished_at = None;
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.push_history(now, None);
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.claimed_by = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_failed(
        &mut self,
        error: String,
        kind: FailureKind,
        backoff: &RetryBackoff,
        now: DateTime<Utc>,
    ) -> FailDisposition {
        self.push_history(now, Some(error.clone()));
        self.error = Some(error);
        self.claimed_by = None;
        self.updated_at = now;

        if kind == FailureKind::Permanent {
            // Exhaust the budget so "failed implies attempts >= max_attempts" holds.
            self.max_attempts = self.attempts;
        }

        if self.attempts < self.max_attempts {
            let delay = backoff.delay_for_attempt(self.attempts);
            let available_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = JobStatus::Pending;
            self.available_at = available_at;
            FailDisposition::Retry { available_at }
        } else {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            FailDisposition::DeadLettered
        }
    }

    pub(crate) fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Operator re-queue of a dead letter with `extra_attempts` more tries.
    pub(crate) fn requeue(&mut self, extra_attempts: u32, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.max_attempts = self.attempts + extra_attempts.max(1);
        self.available_at = now;
        self.finished_at = None;
        self.updated_at = now;
    }

    fn push_history(&mut self, now: DateTime<Utc>, error: Option<String>) {
        let started_at = self.started_at.unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            worker: self.claimed_by.clone(),
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Validated input for `JobStore::insert`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub priority: i32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
}

impl NewJob {
    /// A job of `job_type` with default options, available immediately.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            available_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = at;
        self
    }

    /// Check the input and normalise a null payload to `{}`.
    pub fn validate(mut self) -> QueueResult<Self> {
        if self.job_type.trim().is_empty() {
            return Err(QueueError::validation("job_type must not be empty"));
        }
        if self.queue.trim().is_empty() {
            return Err(QueueError::validation("queue must not be empty"));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(QueueError::validation(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::validation("max_attempts must be at least 1"));
        }
        match self.payload {
            serde_json::Value::Null => self.payload = serde_json::json!({}),
            serde_json::Value::Object(_) => {}
            _ => return Err(QueueError::validation("payload must be a JSON object")),
        }
        Ok(self)
    }
}

/// Producer-side options for `QueueManager::enqueue`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnqueueOptions {
    pub priority: Option<i32>,
    pub queue: Option<String>,
    #[serde(default)]
    pub delay_seconds: u64,
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_delay_seconds(mut self, delay_seconds: u64) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Restricts which jobs a claimer may receive. Empty means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    pub queue: Option<String>,
    pub job_types: Option<Vec<String>>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn job_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        self.job_types = if types.is_empty() { None } else { Some(types) };
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.queue.as_ref().is_none_or(|q| &job.queue == q)
            && self
                .job_types
                .as_ref()
                .is_none_or(|types| types.iter().any(|t| t == &job.job_type))
    }
}

/// How a failure report should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry while attempts remain
    Retryable,
    /// Retrying cannot help (e.g. no handler); dead-letter now
    Permanent,
}

/// Result of a completion/failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The report changed the job
    Applied,
    /// The job already reflects this kind of report; nothing changed
    Duplicate,
}

/// Filter for operator listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub queue: Option<String>,
    pub limit: usize,
}

impl Default for JobListFilter {
    fn default() -> Self {
        Self {
            status: None,
            queue: None,
            limit: 100,
        }
    }
}

/// Aggregate, read-only view of a queue (or all queues).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed_today: u64,
    pub failed_last_24h: u64,
    pub cancelled: u64,
    pub avg_duration_ms: Option<f64>,
    pub max_duration_ms: Option<u64>,
    pub active_workers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn claimed_job(max_attempts: u32) -> Job {
        let now = Utc::now();
        let new = NewJob::new("test", serde_json::json!({"key": "value"}))
            .with_max_attempts(max_attempts)
            .validate()
            .unwrap();
        let mut job = Job::from_new(JobId::new(1), new, now);
        job.mark_processing(&WorkerId::from("w1"), now);
        job
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let backoff = RetryBackoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = RetryBackoff::fixed(Duration::from_millis(500));

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(RetryBackoff::none().delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = RetryBackoff::linear(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn status_round_trips_through_its_name() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for from in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(NewJob::new("", serde_json::json!({})).validate().is_err());
        assert!(NewJob::new("x", serde_json::json!({})).with_priority(0).validate().is_err());
        assert!(NewJob::new("x", serde_json::json!({})).with_priority(11).validate().is_err());
        assert!(NewJob::new("x", serde_json::json!({})).with_max_attempts(0).validate().is_err());
        assert!(NewJob::new("x", serde_json::json!([1, 2])).validate().is_err());

        let normalised = NewJob::new("x", serde_json::Value::Null).validate().unwrap();
        assert_eq!(normalised.payload, serde_json::json!({}));
    }

    #[test]
    fn claim_filter_matches_queue_and_types() {
        let job = claimed_job(3);

        assert!(ClaimFilter::any().matches(&job));
        assert!(ClaimFilter::any().queue("default").matches(&job));
        assert!(!ClaimFilter::any().queue("emails").matches(&job));
        assert!(ClaimFilter::any().job_types(["other", "test"]).matches(&job));
        assert!(!ClaimFilter::any().job_types(["other"]).matches(&job));
        assert_eq!(ClaimFilter::any().job_types(Vec::<String>::new()), ClaimFilter::any());
    }

    #[test]
    fn job_lifecycle() {
        let mut job = claimed_job(3);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.claimed_by, Some(WorkerId::from("w1")));

        job.mark_completed(serde_json::json!({"sent": true}), Utc::now());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.claimed_by, None);
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
        assert!(job.processing_duration().is_some());
    }

    #[test]
    fn job_failure_and_retry() {
        let mut job = claimed_job(2);
        let now = Utc::now();

        let first = job.mark_failed("error 1".into(), FailureKind::Retryable, &RetryBackoff::none(), now);
        assert_eq!(first, FailDisposition::Retry { available_at: now });
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.claimed_by, None);

        job.mark_processing(&WorkerId::from("w2"), now);
        let second = job.mark_failed("error 2".into(), FailureKind::Retryable, &RetryBackoff::none(), now);
        assert_eq!(second, FailDisposition::DeadLettered);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error.as_deref(), Some("error 2"));
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn permanent_failure_exhausts_budget() {
        let mut job = claimed_job(5);
        let disposition =
            job.mark_failed("no handler".into(), FailureKind::Permanent, &RetryBackoff::none(), Utc::now());

        assert_eq!(disposition, FailDisposition::DeadLettered);
        assert_eq!(job.max_attempts, 1);
        assert!(job.attempts >= job.max_attempts);
    }

    #[test]
    fn retry_backoff_pushes_available_at_forward() {
        let mut job = claimed_job(3);
        let now = Utc::now();
        let backoff = RetryBackoff::fixed(Duration::from_secs(30));

        job.mark_failed("boom".into(), FailureKind::Retryable, &backoff, now);
        assert_eq!(job.available_at, now + chrono::Duration::seconds(30));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(30)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: backoff never exceeds the configured cap.
        #[test]
        fn backoff_is_capped(
            base_ms in 0u64..10_000,
            cap_ms in 0u64..600_000,
            attempt in 0u32..100,
            jitter in 0.0f64..1.0,
        ) {
            for strategy in [BackoffStrategy::Fixed, BackoffStrategy::Linear, BackoffStrategy::Exponential] {
                let backoff = RetryBackoff {
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_millis(cap_ms),
                    strategy,
                    jitter,
                };
                let delay = backoff.delay_for_attempt(attempt);
                prop_assert!(delay <= Duration::from_millis(cap_ms.max(base_ms)));
            }
        }
    }
}
