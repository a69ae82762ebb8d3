//! Executors: the opaque, possibly-failing unit of work behind a job type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use jobforge_core::{ExecutionFailure, Job};

/// Runs one attempt of a job.
///
/// Deliveries are at-least-once, so an executor may see the same job more
/// than once (e.g. after a crash mid-run). Implementations should be
/// idempotent.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<(), ExecutionFailure>;
}

/// Adapter for synchronous closures.
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F>
where
    F: Fn(&Job) -> Result<(), ExecutionFailure> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> JobExecutor for FnExecutor<F>
where
    F: Fn(&Job) -> Result<(), ExecutionFailure> + Send + Sync,
{
    async fn execute(&self, job: &Job) -> Result<(), ExecutionFailure> {
        (self.0)(job)
    }
}

/// Routes a job to an executor by its `type`.
///
/// Lookup order:
/// 1. exact match (`"email.send"`)
/// 2. category match, longest prefix wins (`"email.*"`)
/// 3. wildcard (`"*"`)
///
/// A job whose type matches nothing fails the attempt like any other
/// execution failure, so it goes through the retry path.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    handlers: HashMap<String, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a type pattern.
    pub fn register(&mut self, pattern: impl Into<String>, executor: impl JobExecutor + 'static) {
        self.handlers.insert(pattern.into(), Arc::new(executor));
    }

    /// Register a synchronous closure for a type pattern.
    pub fn register_fn<F>(&mut self, pattern: impl Into<String>, f: F)
    where
        F: Fn(&Job) -> Result<(), ExecutionFailure> + Send + Sync + 'static,
    {
        self.register(pattern, FnExecutor::new(f));
    }

    fn resolve(&self, job_type: &str) -> Option<&Arc<dyn JobExecutor>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                job_type
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);

        category.or_else(|| self.handlers.get("*"))
    }
}

impl core::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("ExecutorRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

#[async_trait]
impl JobExecutor for ExecutorRegistry {
    async fn execute(&self, job: &Job) -> Result<(), ExecutionFailure> {
        match self.resolve(&job.job_type) {
            Some(executor) => executor.execute(job).await,
            None => Err(ExecutionFailure::new(format!(
                "no executor registered for job type: {}",
                job.job_type
            ))),
        }
    }
}

/// Stand-in unit of work for demos and local runs.
///
/// Odd ids always fail with `simulated failure`; even ids sleep for
/// `duration` and succeed.
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    duration: Duration,
}

impl SimulatedWork {
    pub const FAILURE: &'static str = "simulated failure";

    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl JobExecutor for SimulatedWork {
    async fn execute(&self, job: &Job) -> Result<(), ExecutionFailure> {
        if job.id.get() % 2 != 0 {
            return Err(ExecutionFailure::new(Self::FAILURE));
        }

        debug!(job_id = %job.id, duration_ms = self.duration.as_millis() as u64, "simulating work");
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use jobforge_core::{JobId, NewJob};

    use super::*;

    fn job(id: i64, kind: &str) -> Job {
        let new = NewJob::new(kind, Some(serde_json::json!({}))).unwrap();
        Job::from_new(JobId::new(id), new, Utc::now())
    }

    fn tagging(tag: &'static str) -> impl Fn(&Job) -> Result<(), ExecutionFailure> {
        move |_job| Err(ExecutionFailure::new(tag))
    }

    #[tokio::test]
    async fn exact_match_wins() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("report", |_job| Ok(()));
        registry.register_fn("*", tagging("wildcard"));

        assert!(registry.execute(&job(1, "report")).await.is_ok());
    }

    #[tokio::test]
    async fn longest_category_wins() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("email.*", tagging("email"));
        registry.register_fn("email.bulk.*", tagging("bulk"));

        let err = registry
            .execute(&job(1, "email.bulk.weekly"))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "bulk");

        let err = registry.execute(&job(1, "email.send")).await.unwrap_err();
        assert_eq!(err.reason(), "email");
    }

    #[tokio::test]
    async fn category_requires_a_dot_boundary() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("email.*", |_job| Ok(()));

        assert!(registry.execute(&job(1, "emailer")).await.is_err());
    }

    #[tokio::test]
    async fn wildcard_handler() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("*", |_job| Ok(()));

        assert!(registry.execute(&job(1, "anything")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_type_is_an_execution_failure() {
        let registry = ExecutorRegistry::new();

        let err = registry.execute(&job(1, "mystery")).await.unwrap_err();
        assert_eq!(err.reason(), "no executor registered for job type: mystery");
    }

    #[tokio::test]
    async fn simulated_work_fails_odd_ids() {
        let work = SimulatedWork::new(Duration::ZERO);

        let err = work.execute(&job(3, "x")).await.unwrap_err();
        assert_eq!(err.reason(), SimulatedWork::FAILURE);
        assert!(work.execute(&job(4, "x")).await.is_ok());
    }
}
