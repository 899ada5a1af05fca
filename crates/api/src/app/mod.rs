//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store/queue wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router around already-constructed services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(services))
}

/// Build the router with services configured from the environment
/// (public entrypoint used by `main.rs`).
pub async fn build_app_from_env() -> anyhow::Result<Router> {
    let services = AppServices::from_env().await?;
    Ok(build_app(Arc::new(services)))
}
