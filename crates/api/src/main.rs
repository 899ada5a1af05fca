use anyhow::Context;
use tokio::signal;

const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let bind = std::env::var("JOBFORGE_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let app = jobforge_api::app::build_app_from_env().await?;

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = signal::ctrl_c().await {
                tracing::warn!(%error, "failed to listen for ctrl-c");
            }
        })
        .await?;

    tracing::info!("server stopped");
    Ok(())
}
