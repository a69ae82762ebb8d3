//! Job submission: validate, persist, then dispatch.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument};

use jobforge_core::{Job, JobId, JobStatus, NewJob, RetryPolicy, ValidationError};
use jobforge_events::{DispatchChannel, PublishError};

use super::store::{JobStore, JobStoreError};

/// Result of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submitted {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to create job: {0}")]
    Store(#[from] JobStoreError),

    /// The row exists (PENDING) but was never dispatched.
    #[error("job {job_id} created but not dispatched: {source}")]
    Publish {
        job_id: JobId,
        #[source]
        source: PublishError,
    },
}

/// Accepts jobs from clients.
///
/// The store insert and the publish are two separate steps. If the publish
/// fails the job stays PENDING in the store with nothing in the channel.
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn JobStore>,
    channel: Arc<dyn DispatchChannel>,
    max_retries: u32,
}

impl core::fmt::Debug for SubmissionService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubmissionService")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl SubmissionService {
    pub fn new(store: Arc<dyn JobStore>, channel: Arc<dyn DispatchChannel>) -> Self {
        Self {
            store,
            channel,
            max_retries: RetryPolicy::DEFAULT_MAX_RETRIES,
        }
    }

    /// Attempt ceiling stamped on every job this service creates. Zero is
    /// raised to one, as in `NewJob::with_max_retries`.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    #[instrument(skip(self, payload), err)]
    pub async fn submit(
        &self,
        job_type: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<Submitted, SubmitError> {
        let new = NewJob::new(job_type, payload)?.with_max_retries(self.max_retries);

        let job_id = self.store.create_job(new).await?;

        if let Err(source) = self.channel.publish(job_id).await {
            error!(job_id = %job_id, error = %source, "job persisted but dispatch failed");
            return Err(SubmitError::Publish { job_id, source });
        }

        info!(job_id = %job_id, job_type, "job submitted");

        Ok(Submitted {
            job_id,
            status: JobStatus::Pending,
        })
    }

    /// Read a job back for status polling.
    pub async fn lookup(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jobforge_events::InMemoryDispatchChannel;

    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    fn service() -> (SubmissionService, Arc<InMemoryJobStore>, Arc<InMemoryDispatchChannel>) {
        let store = InMemoryJobStore::arc();
        let channel = Arc::new(InMemoryDispatchChannel::new());
        let svc = SubmissionService::new(store.clone(), channel.clone());
        (svc, store, channel)
    }

    #[tokio::test]
    async fn submit_persists_then_publishes() {
        let (svc, store, channel) = service();

        let out = svc
            .submit("email", Some(serde_json::json!({"to": "a@b.c"})))
            .await
            .unwrap();

        assert_eq!(out.status, JobStatus::Pending);
        assert_eq!(channel.published_count(), 1);
        let mut sub = channel.subscribe().await.unwrap();
        assert_eq!(
            sub.recv_timeout(Duration::from_millis(50)).await.unwrap().job_id,
            out.job_id
        );
        let job = store.get(out.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.payload, serde_json::json!({"to": "a@b.c"}));
    }

    #[tokio::test]
    async fn ids_strictly_increase() {
        let (svc, _, _) = service();

        let mut last = None;
        for n in 0..5 {
            let id = svc
                .submit("x", Some(serde_json::json!({ "n": n })))
                .await
                .unwrap()
                .job_id;
            if let Some(prev) = last {
                assert!(id > prev);
            }
            last = Some(id);
        }
    }

    #[tokio::test]
    async fn invalid_input_creates_nothing() {
        let (svc, store, channel) = service();

        assert!(matches!(
            svc.submit("  ", Some(serde_json::json!({}))).await,
            Err(SubmitError::Validation(ValidationError::EmptyType))
        ));
        assert!(matches!(
            svc.submit("x", None).await,
            Err(SubmitError::Validation(ValidationError::MissingPayload))
        ));

        assert!(store.get(JobId::new(1)).await.unwrap().is_none());
        assert_eq!(channel.published_count(), 0);
    }

    #[tokio::test]
    async fn store_failure_publishes_nothing() {
        let (svc, store, channel) = service();
        store.set_available(false);

        let err = svc.submit("x", Some(serde_json::json!({}))).await.unwrap_err();

        assert!(matches!(err, SubmitError::Store(JobStoreError::Storage(_))));
        assert_eq!(channel.published_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_leaves_pending_job_that_is_never_delivered() {
        let (svc, store, channel) = service();
        let mut sub = channel.subscribe().await.unwrap();
        channel.set_available(false);

        let err = svc.submit("x", Some(serde_json::json!({}))).await.unwrap_err();

        let job_id = match err {
            SubmitError::Publish { job_id, .. } => job_id,
            other => panic!("unexpected error: {other:?}"),
        };
        assert_eq!(store.get_status(job_id).await.unwrap(), JobStatus::Pending);

        channel.set_available(true);
        assert!(sub.recv_timeout(Duration::from_millis(50)).await.is_err());
    }

    #[tokio::test]
    async fn configured_ceiling_is_stamped_on_jobs() {
        let (svc, store, _) = service();
        let svc = svc.with_max_retries(7);

        let out = svc.submit("x", Some(serde_json::json!([]))).await.unwrap();

        assert_eq!(store.get(out.job_id).await.unwrap().unwrap().max_retries, 7);
    }

    #[tokio::test]
    async fn zero_ceiling_is_stamped_as_one() {
        let (svc, store, _) = service();
        let svc = svc.with_max_retries(0);

        let out = svc.submit("x", Some(serde_json::json!([]))).await.unwrap();

        assert_eq!(store.get(out.job_id).await.unwrap().unwrap().max_retries, 1);
    }
}
