//! Standalone worker: consumes the durable dispatch stream until stopped.

use anyhow::Context;

use jobforge_api::app::services::{self, Infra};
use jobforge_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    if !config.persistent {
        anyhow::bail!("the standalone worker needs USE_PERSISTENT_STORES=true");
    }

    let infra = Infra::from_config(&config).await?;
    let worker = services::spawn_worker(&config, &infra, &config.dispatch.consumer).await?;

    jobforge_api::shutdown_signal().await;

    let stats = worker.stats();
    worker.shutdown().await;
    tracing::info!(?stats, "worker stopped");

    Ok(())
}
