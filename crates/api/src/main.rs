use std::sync::Arc;

use anyhow::Context;

use jobforge_api::app::{build_app, services};
use jobforge_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let (services, worker) = services::build_services(&config).await?;
    let app = build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(jobforge_api::shutdown_signal())
        .await?;

    if let Some(worker) = worker {
        let stats = worker.stats();
        worker.shutdown().await;
        tracing::info!(?stats, "embedded worker stopped");
    }

    Ok(())
}
