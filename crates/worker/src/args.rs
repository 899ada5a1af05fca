use std::time::Duration;

use clap::Parser;

use jobforge_infra::jobs::{ClaimFilter, WorkerConfig};

#[derive(Parser, Debug)]
#[command(about = "Runs queued jobs until interrupted", long_about = None, version)]
pub(crate) struct Args {
    /// Only claim jobs from this queue.
    #[arg(short, long)]
    pub(crate) queue: Option<String>,
    /// Comma-separated allow-list of job types (default: every registered type).
    #[arg(short = 't', long, value_delimiter = ',')]
    pub(crate) job_types: Vec<String>,
    /// Exit after processing this many jobs.
    #[arg(short, long)]
    pub(crate) max_jobs: Option<u64>,
    /// Seconds to sleep when no job is available.
    #[arg(short, long, default_value_t = 5)]
    pub(crate) sleep_interval: u64,
    /// Seconds to back off after a store error.
    #[arg(long, default_value_t = 10)]
    pub(crate) error_backoff: u64,
    /// Release jobs claimed longer than this many seconds ago (crashed workers).
    #[arg(long)]
    pub(crate) stale_after: Option<u64>,
    /// Worker identity (default: host:pid:suffix).
    #[arg(long)]
    pub(crate) worker_id: Option<String>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

impl Args {
    pub(crate) fn worker_config(&self) -> WorkerConfig {
        let job_types = self.job_types.iter().map(|t| t.trim()).filter(|t| !t.is_empty());
        let mut filter = ClaimFilter::any().job_types(job_types);
        if let Some(queue) = &self.queue {
            filter = filter.queue(queue.clone());
        }

        let mut config = WorkerConfig::default()
            .with_filter(filter)
            .with_poll_interval(Duration::from_secs(self.sleep_interval.max(1)))
            .with_error_backoff(Duration::from_secs(self.error_backoff.max(1)));
        if let Some(id) = &self.worker_id {
            config = config.with_worker_id(id.as_str());
        }
        if let Some(max_jobs) = self.max_jobs {
            config = config.with_max_jobs(max_jobs);
        }
        if let Some(secs) = self.stale_after {
            config = config.with_stale_after(Duration::from_secs(secs));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["jobforge-worker"]).unwrap();
        let config = args.worker_config();

        assert_eq!(config.filter, ClaimFilter::any());
        assert_eq!(config.max_jobs, None);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(!args.debug);
    }

    #[test]
    fn filters_and_limits() {
        let args = Args::try_parse_from([
            "jobforge-worker",
            "--queue",
            "emails",
            "--job-types",
            "send_email, generate_report",
            "--max-jobs",
            "10",
            "--sleep-interval",
            "2",
            "--worker-id",
            "w-1",
        ])
        .unwrap();
        let config = args.worker_config();

        assert_eq!(config.filter.queue.as_deref(), Some("emails"));
        assert_eq!(
            config.filter.job_types,
            Some(vec!["send_email".to_string(), "generate_report".to_string()])
        );
        assert_eq!(config.max_jobs, Some(10));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.worker_id.as_str(), "w-1");
    }

    #[test]
    fn rejects_non_numeric_limits() {
        assert!(Args::try_parse_from(["jobforge-worker", "--max-jobs", "lots"]).is_err());
    }
}
