use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use jobforge_core::JobId;
use jobforge_infra::jobs::Job;

use crate::app::dto::{EnqueueRequest, EnqueueResponse, ListJobsQuery};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/retry", post(retry_job))
}

pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let options = body.options();
    let id = services
        .queue
        .enqueue(body.job_type, body.payload, options)
        .await?;

    Ok((StatusCode::CREATED, Json(EnqueueResponse { id: id.as_i64() })))
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id: JobId = id.parse()?;
    Ok(Json(services.queue.get_status(id).await?))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let items = services.queue.list(&query.into_filter()?).await?;
    Ok(Json(serde_json::json!({ "items": items })))
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id: JobId = id.parse()?;
    Ok(Json(services.queue.cancel(id).await?))
}

/// Operator re-queue of a dead-lettered job.
pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id: JobId = id.parse()?;
    Ok(Json(services.queue.retry_failed(id).await?))
}
