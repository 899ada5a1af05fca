use serde::{Deserialize, Serialize};

use jobforge_infra::jobs::{EnqueueOptions, JobListFilter, JobStatus};

use crate::app::errors::ApiError;

/// Upper bound for `GET /jobs?limit=`.
pub const MAX_LIST_LIMIT: usize = 1_000;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
    pub queue: Option<String>,
    #[serde(default)]
    pub delay_seconds: u64,
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn options(&self) -> EnqueueOptions {
        EnqueueOptions {
            priority: self.priority,
            queue: self.queue.clone(),
            delay_seconds: self.delay_seconds,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub queue: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobListFilter, ApiError> {
        let status = self
            .status
            .map(|s| s.parse::<JobStatus>())
            .transpose()?;
        let defaults = JobListFilter::default();
        Ok(JobListFilter {
            status,
            queue: self.queue,
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_LIST_LIMIT),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub queue: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: i64,
}
