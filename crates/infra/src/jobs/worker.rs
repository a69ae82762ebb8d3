//! The worker loop: consumes job ids from the dispatch channel and drives
//! each job through its state machine.
//!
//! ```text
//! delivery(id)
//!   ├─ job missing ............................ ack, skip
//!   ├─ job DONE/FAILED ........................ ack, skip (redelivery)
//!   ├─ set RUNNING ─ fails .................... abandon (no ack)
//!   └─ execute
//!        ├─ ok ─ set DONE ..................... ack
//!        └─ err ─ read retry_count, +1
//!             ├─ >= max_retries ─ FAILED ...... ack
//!             └─ else PENDING, (backoff), publish(id) at tail
//!                  └─ publish fails ........... ack, logged: needs reconciliation
//! ```
//!
//! Processing is strictly serial: one delivery is fully resolved before the
//! next one is read. Errors end the current delivery only; the loop keeps
//! draining.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobforge_core::{JobId, JobStatus, RetryDecision, RetryPolicy};
use jobforge_events::{ChannelError, Delivery, DispatchChannel, Subscription};

use super::executor::JobExecutor;
use super::store::{JobStore, JobStoreError};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Backoff between a failed attempt and its re-dispatch
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Executor succeeded, job is DONE.
    Completed,
    /// Attempt failed, job is PENDING again and re-published.
    Retried { retry_count: u32 },
    /// Attempt failed, job is PENDING but the re-publish failed. The job will
    /// not run again until something re-publishes it.
    RetryNotDispatched { retry_count: u32 },
    /// Retries exhausted, job is FAILED.
    Failed { retry_count: u32 },
    /// Job was already DONE or FAILED; nothing executed.
    SkippedTerminal(JobStatus),
    /// No such job in the store.
    Missing,
}

/// A delivery the worker could not resolve because the store failed.
///
/// The delivery is left unacknowledged so a restarted consumer sees it again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery abandoned for job {job_id}: {source}")]
pub struct Abandoned {
    pub job_id: JobId,
    #[source]
    pub source: JobStoreError,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub deliveries: u64,
    pub completed: u64,
    pub retried: u64,
    pub retry_not_dispatched: u64,
    pub failed: u64,
    pub skipped: u64,
    pub abandoned: u64,
}

impl WorkerStats {
    fn record(&mut self, result: &Result<Outcome, Abandoned>) {
        self.deliveries += 1;
        match result {
            Ok(Outcome::Completed) => self.completed += 1,
            Ok(Outcome::Retried { .. }) => self.retried += 1,
            Ok(Outcome::RetryNotDispatched { .. }) => self.retry_not_dispatched += 1,
            Ok(Outcome::Failed { .. }) => self.failed += 1,
            Ok(Outcome::SkippedTerminal(_)) | Ok(Outcome::Missing) => self.skipped += 1,
            Err(_) => self.abandoned += 1,
        }
    }
}

/// Single sequential consumer of the dispatch channel.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    channel: Arc<dyn DispatchChannel>,
    executor: Arc<dyn JobExecutor>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        channel: Arc<dyn DispatchChannel>,
        executor: Arc<dyn JobExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            channel,
            executor,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Run the state machine for one job id.
    pub async fn process(&self, job_id: JobId) -> Result<Outcome, Abandoned> {
        let abandon = |source| Abandoned { job_id, source };

        let job = match self.store.get(job_id).await.map_err(abandon)? {
            Some(job) => job,
            None => return Ok(Outcome::Missing),
        };

        // At-least-once redelivery of a finished job: never run it again.
        if job.status.is_terminal() {
            return Ok(Outcome::SkippedTerminal(job.status));
        }

        self.store
            .set_status(job_id, JobStatus::Running)
            .await
            .map_err(abandon)?;

        let failure = match self.executor.execute(&job).await {
            Ok(()) => {
                self.store
                    .set_status(job_id, JobStatus::Done)
                    .await
                    .map_err(abandon)?;
                return Ok(Outcome::Completed);
            }
            Err(failure) => failure,
        };

        let retry_count = self.store.read_retry_count(job_id).await.map_err(abandon)?;
        let decision = self
            .config
            .retry_policy
            .decide(retry_count, job.max_retries);

        self.store
            .record_failure(
                job_id,
                decision.retry_count(),
                failure.reason(),
                decision.is_terminal(),
            )
            .await
            .map_err(abandon)?;

        match decision {
            RetryDecision::GiveUp { retry_count } => {
                warn!(
                    worker = %self.config.name,
                    job_id = %job_id,
                    retry_count,
                    error = %failure,
                    "job permanently failed"
                );
                Ok(Outcome::Failed { retry_count })
            }
            RetryDecision::Retry { retry_count, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                match self.channel.publish(job_id).await {
                    Ok(()) => {
                        info!(
                            worker = %self.config.name,
                            job_id = %job_id,
                            attempt = retry_count,
                            error = %failure,
                            "retry scheduled"
                        );
                        Ok(Outcome::Retried { retry_count })
                    }
                    Err(e) => {
                        error!(
                            worker = %self.config.name,
                            job_id = %job_id,
                            retry_count,
                            error = %e,
                            "failed to re-publish job; left PENDING until reconciled"
                        );
                        Ok(Outcome::RetryNotDispatched { retry_count })
                    }
                }
            }
        }
    }

    /// Process one delivery, acknowledge it when resolved, and record stats.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<Outcome, Abandoned> {
        let job_id = delivery.job_id;
        debug!(worker = %self.config.name, job_id = %job_id, "processing job");

        let result = self.process(job_id).await;

        match &result {
            Ok(outcome) => {
                match outcome {
                    Outcome::Completed => info!(worker = %self.config.name, job_id = %job_id, "job completed"),
                    Outcome::SkippedTerminal(status) => {
                        debug!(worker = %self.config.name, job_id = %job_id, status = %status, "job already terminal, skipped")
                    }
                    Outcome::Missing => warn!(worker = %self.config.name, job_id = %job_id, "job not found, skipped"),
                    _ => {}
                }

                if let Err(e) = self.channel.ack(delivery).await {
                    warn!(worker = %self.config.name, job_id = %job_id, error = %e, "failed to acknowledge delivery");
                }
            }
            Err(e) => {
                error!(worker = %self.config.name, job_id = %job_id, error = %e, "delivery abandoned");
            }
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.record(&result);
        }

        result
    }

    /// Consume `subscription` until it closes or `shutdown` fires.
    ///
    /// Shutdown is observed between deliveries; the delivery in flight is
    /// finished first.
    pub async fn run(self, mut subscription: Subscription, mut shutdown: oneshot::Receiver<()>) {
        info!(worker = %self.config.name, "job worker started");

        // A dropped handle (sender gone) leaves the worker running.
        let mut armed = true;

        loop {
            tokio::select! {
                biased;

                signal = &mut shutdown, if armed => {
                    if signal.is_ok() {
                        break;
                    }
                    armed = false;
                }
                next = subscription.recv() => {
                    match next {
                        Some(delivery) => {
                            let _ = self.handle_delivery(&delivery).await;
                        }
                        None => {
                            warn!(worker = %self.config.name, "subscription closed");
                            break;
                        }
                    }
                }
            }
        }

        info!(worker = %self.config.name, "job worker stopped");
    }

    /// Subscribe and run the loop on a background task.
    pub async fn spawn(self) -> Result<WorkerHandle, ChannelError> {
        let subscription = self.channel.subscribe().await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = self.stats.clone();

        let join = tokio::spawn(self.run(subscription, shutdown_rx));

        Ok(WorkerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        })
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop after the in-flight delivery and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Hard stop: the in-flight executor call is dropped. Its job keeps
    /// whatever state was last written (usually RUNNING) and its delivery
    /// stays unacknowledged.
    pub fn abort(mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}
