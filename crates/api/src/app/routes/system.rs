use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Extension, Query},
    Json,
};

use jobforge_infra::jobs::QueueStats;

use crate::app::dto::StatsQuery;
use crate::app::errors::ApiError;
use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "backend": services.backend }))
}

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> Result<Json<QueueStats>, ApiError> {
    let Query(query) = query?;
    let stats = services.queue.stats(query.queue.as_deref()).await?;
    Ok(Json(stats))
}
