//! Built-in handlers registered by the worker binary.
//!
//! Each validates its payload, logs the work it stands in for, and returns a
//! small JSON summary that is stored as the job result.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use jobforge_infra::jobs::{HandlerError, HandlerRegistry, Job, JobHandler};

pub(crate) fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("send_email", SendEmail)
        .register("generate_report", GenerateReport)
        .register("cleanup_files", CleanupFiles);
    registry
}

#[derive(Debug, Deserialize)]
struct EmailPayload {
    to: String,
    #[serde(default)]
    subject: Option<String>,
}

struct SendEmail;

#[async_trait]
impl JobHandler for SendEmail {
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        let payload: EmailPayload = serde_json::from_value(job.payload.clone())?;
        if !payload.to.contains('@') {
            return Err(HandlerError::new(format!("invalid recipient '{}'", payload.to)));
        }

        info!(job_id = %job.id, to = %payload.to, subject = ?payload.subject, "sending email");
        Ok(serde_json::json!({ "sent": true, "to": payload.to }))
    }
}

#[derive(Debug, Deserialize)]
struct ReportPayload {
    report: String,
    #[serde(default = "default_format")]
    format: String,
}

fn default_format() -> String {
    "pdf".to_string()
}

struct GenerateReport;

#[async_trait]
impl JobHandler for GenerateReport {
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        let payload: ReportPayload = serde_json::from_value(job.payload.clone())?;

        info!(job_id = %job.id, report = %payload.report, format = %payload.format, "generating report");
        Ok(serde_json::json!({
            "report": payload.report,
            "format": payload.format,
            "file": format!("reports/{}-{}.{}", payload.report, job.id, payload.format),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct CleanupPayload {
    path: String,
    #[serde(default = "default_age_days")]
    older_than_days: u32,
}

fn default_age_days() -> u32 {
    30
}

struct CleanupFiles;

#[async_trait]
impl JobHandler for CleanupFiles {
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        let payload: CleanupPayload = serde_json::from_value(job.payload.clone())?;
        if payload.path.trim().is_empty() || payload.path == "/" {
            return Err(HandlerError::new("refusing to clean an empty or root path"));
        }

        info!(
            job_id = %job.id,
            path = %payload.path,
            older_than_days = payload.older_than_days,
            "cleaning up files"
        );
        Ok(serde_json::json!({
            "path": payload.path,
            "older_than_days": payload.older_than_days,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_infra::jobs::{ClaimFilter, EnqueueOptions, InMemoryJobStore, QueueManager};

    async fn run(job_type: &str, payload: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        let manager = QueueManager::new(InMemoryJobStore::new());
        manager
            .enqueue(job_type, payload, EnqueueOptions::default())
            .await
            .unwrap();
        let job = manager
            .dequeue(&ClaimFilter::any(), &"test".into())
            .await
            .unwrap()
            .unwrap();
        registry().resolve(job_type).unwrap().execute(&job).await
    }

    #[test]
    fn registers_builtin_types() {
        assert_eq!(
            registry().job_types(),
            vec!["cleanup_files", "generate_report", "send_email"]
        );
    }

    #[tokio::test]
    async fn send_email_requires_a_recipient() {
        let ok = run("send_email", serde_json::json!({"to": "a@x.com"})).await.unwrap();
        assert_eq!(ok["sent"], true);

        let err = run("send_email", serde_json::json!({})).await.unwrap_err();
        assert!(err.0.starts_with("invalid payload"));

        let err = run("send_email", serde_json::json!({"to": "nobody"})).await.unwrap_err();
        assert!(err.0.contains("invalid recipient"));
    }

    #[tokio::test]
    async fn generate_report_defaults_to_pdf() {
        let out = run("generate_report", serde_json::json!({"report": "sales"})).await.unwrap();
        assert_eq!(out["format"], "pdf");
        assert!(out["file"].as_str().unwrap().ends_with(".pdf"));
    }

    #[tokio::test]
    async fn cleanup_refuses_root() {
        assert!(run("cleanup_files", serde_json::json!({"path": "/"})).await.is_err());
        let out = run("cleanup_files", serde_json::json!({"path": "/tmp/exports"})).await.unwrap();
        assert_eq!(out["older_than_days"], 30);
    }
}
