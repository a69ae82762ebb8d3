use std::sync::Arc;

use anyhow::Context;

use jobforge_events::{DispatchChannel, InMemoryDispatchChannel};
use jobforge_infra::config::AppConfig;
use jobforge_infra::jobs::{
    ExecutorRegistry, InMemoryJobStore, JobStore, SimulatedWork, SubmissionService, Worker,
    WorkerConfig, WorkerHandle,
};

#[cfg(feature = "redis")]
use jobforge_infra::{event_bus::RedisStreamsDispatchChannel, jobs::SqliteJobStore};

/// Services shared by every request handler.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub submission: SubmissionService,
}

/// The store and channel a process runs against.
#[derive(Clone)]
pub struct Infra {
    pub store: Arc<dyn JobStore>,
    pub channel: Arc<dyn DispatchChannel>,
}

impl Infra {
    pub fn in_memory() -> Self {
        Self {
            store: InMemoryJobStore::arc(),
            channel: Arc::new(InMemoryDispatchChannel::new()),
        }
    }

    /// SQLite job store + Redis Streams dispatch.
    #[cfg(feature = "redis")]
    pub async fn persistent(config: &AppConfig) -> anyhow::Result<Self> {
        let store = SqliteJobStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open job store at {}", config.database_url))?;
        let channel = RedisStreamsDispatchChannel::connect(&config.dispatch)
            .await
            .with_context(|| format!("failed to connect to {}", config.dispatch.redis_url))?;

        Ok(Self {
            store: Arc::new(store),
            channel: Arc::new(channel),
        })
    }

    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        if !config.persistent {
            return Ok(Self::in_memory());
        }

        #[cfg(feature = "redis")]
        let infra = Self::persistent(config).await?;

        #[cfg(not(feature = "redis"))]
        let infra = {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
            Self::in_memory()
        };

        Ok(infra)
    }
}

/// Every job type runs the simulated unit of work.
pub fn default_executor(config: &AppConfig) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register("*", SimulatedWork::new(config.worker.simulated_work));
    registry
}

/// Subscribe a worker to `infra` and start it on a background task.
pub async fn spawn_worker(
    config: &AppConfig,
    infra: &Infra,
    name: &str,
) -> anyhow::Result<WorkerHandle> {
    let worker = Worker::new(
        infra.store.clone(),
        infra.channel.clone(),
        Arc::new(default_executor(config)),
        WorkerConfig::default()
            .with_name(name)
            .with_retry_policy(config.worker.retry_policy()),
    );

    worker
        .spawn()
        .await
        .context("failed to subscribe to dispatch channel")
}

/// Wire up the API process: request services plus, when configured, an
/// embedded worker.
pub async fn build_services(
    config: &AppConfig,
) -> anyhow::Result<(AppServices, Option<WorkerHandle>)> {
    let infra = Infra::from_config(config).await?;

    let submission = SubmissionService::new(infra.store.clone(), infra.channel.clone())
        .with_max_retries(config.worker.max_retries);

    let worker = if config.worker.embedded {
        Some(spawn_worker(config, &infra, "embedded-worker").await?)
    } else {
        None
    };

    tracing::info!(
        persistent = config.persistent,
        embedded_worker = worker.is_some(),
        "services initialized"
    );

    Ok((AppServices { submission }, worker))
}
