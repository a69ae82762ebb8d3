//! Job storage abstraction and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use jobforge_core::{Job, JobId, JobStatus, NewJob};

/// Durable table of job records; the only source of truth for job state.
///
/// Every write is atomic at the row level. `record_failure` in particular
/// must never apply the status without the retry count (or vice versa).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new PENDING row with `retry_count = 0` and return its id.
    async fn create_job(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Load a full record.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Current status. `NotFound` if no such id.
    async fn get_status(&self, job_id: JobId) -> Result<JobStatus, JobStoreError>;

    /// Unconditionally set status and refresh `updated_at`.
    async fn set_status(&self, job_id: JobId, status: JobStatus) -> Result<(), JobStoreError>;

    /// Write `retry_count`, `last_error` and status (PENDING, or FAILED when
    /// `terminal`) in one atomic update.
    async fn record_failure(
        &self,
        job_id: JobId,
        retry_count: u32,
        error: &str,
        terminal: bool,
    ) -> Result<(), JobStoreError>;

    /// Current retry count. `NotFound` if no such id.
    async fn read_retry_count(&self, job_id: JobId) -> Result<u32, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

pub(crate) fn failure_status(terminal: bool) -> JobStatus {
    if terminal {
        JobStatus::Failed
    } else {
        JobStatus::Pending
    }
}

#[derive(Debug)]
struct Inner {
    jobs: BTreeMap<JobId, Job>,
    last_id: i64,
}

/// In-memory job store for tests/dev.
///
/// Ids start at 1 and are handed out under the write lock, so they are
/// strictly increasing and never reused.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                jobs: BTreeMap::new(),
                last_id: 0,
            }),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Toggle availability. While unavailable every operation fails with
    /// `JobStoreError::Storage`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(JobStoreError::storage("store unavailable"));
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, JobStoreError> {
        self.check_available()?;
        let inner = self
            .inner
            .read()
            .map_err(|_| JobStoreError::storage("lock poisoned"))?;
        Ok(f(&inner))
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut Inner) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        self.check_available()?;
        let mut inner = self
            .inner
            .write()
            .map_err(|_| JobStoreError::storage("lock poisoned"))?;
        f(&mut inner)
    }

    fn update_row(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job),
    ) -> Result<(), JobStoreError> {
        self.write(|inner| {
            let job = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(JobStoreError::NotFound(job_id))?;
            f(job);
            job.updated_at = Utc::now();
            Ok(())
        })
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        self.write(|inner| {
            inner.last_id += 1;
            let id = JobId::new(inner.last_id);
            inner.jobs.insert(id, Job::from_new(id, job, Utc::now()));
            Ok(id)
        })
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.read(|inner| inner.jobs.get(&job_id).cloned())
    }

    async fn get_status(&self, job_id: JobId) -> Result<JobStatus, JobStoreError> {
        self.read(|inner| inner.jobs.get(&job_id).map(|j| j.status))?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn set_status(&self, job_id: JobId, status: JobStatus) -> Result<(), JobStoreError> {
        self.update_row(job_id, |job| job.status = status)
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        retry_count: u32,
        error: &str,
        terminal: bool,
    ) -> Result<(), JobStoreError> {
        self.update_row(job_id, |job| {
            job.retry_count = retry_count;
            job.last_error = Some(error.to_string());
            job.status = failure_status(terminal);
        })
    }

    async fn read_retry_count(&self, job_id: JobId) -> Result<u32, JobStoreError> {
        self.read(|inner| inner.jobs.get(&job_id).map(|j| j.retry_count))?
            .ok_or(JobStoreError::NotFound(job_id))
    }
}
