//! The job entity and its lifecycle states.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::JobId;
use crate::retry::RetryPolicy;

/// Job lifecycle status.
///
/// ```text
/// PENDING -> RUNNING -> DONE
///                    -> PENDING (retry)
///                    -> FAILED
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Recorded and (normally) on the dispatch channel, waiting for a worker
    Pending,
    /// Claimed by the worker, executor in flight
    Running,
    /// Completed successfully
    Done,
    /// Retries exhausted
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }

    /// DONE and FAILED accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "DONE" => Ok(JobStatus::Done),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(ValidationError::malformed(format!("unknown job status: {other}"))),
        }
    }
}

/// A validated submission, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    job_type: String,
    payload: serde_json::Value,
    max_retries: u32,
}

impl NewJob {
    /// Validate a submission.
    ///
    /// The type must contain a non-whitespace character and the payload must
    /// be present (`null` counts as absent).
    pub fn new(
        job_type: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<Self, ValidationError> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(ValidationError::EmptyType);
        }

        let payload = match payload {
            None | Some(serde_json::Value::Null) => return Err(ValidationError::MissingPayload),
            Some(p) => p,
        };

        Ok(Self {
            job_type,
            payload,
            max_retries: RetryPolicy::DEFAULT_MAX_RETRIES,
        })
    }

    /// Override the retry ceiling stored on the row. A ceiling below one is
    /// raised to one: every job gets at least one attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Opaque kind of work, used to route to an executor
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque payload interpreted by the executor
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Fixed at creation
    pub max_retries: u32,
    /// Most recent failure reason; never cleared once set
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Materialize a freshly inserted row.
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_text() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_done_and_failed_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_upper_case() {
        let v = serde_json::to_value(JobStatus::Pending).unwrap();
        assert_eq!(v, serde_json::json!("PENDING"));
    }

    #[test]
    fn new_job_requires_type() {
        let err = NewJob::new("  ", Some(serde_json::json!({}))).unwrap_err();
        assert_eq!(err, ValidationError::EmptyType);
    }

    #[test]
    fn new_job_requires_payload() {
        assert_eq!(
            NewJob::new("email", None).unwrap_err(),
            ValidationError::MissingPayload
        );
        assert_eq!(
            NewJob::new("email", Some(serde_json::Value::Null)).unwrap_err(),
            ValidationError::MissingPayload
        );
    }

    #[test]
    fn new_job_defaults_to_three_retries() {
        let job = NewJob::new("x", Some(serde_json::json!([1, 2]))).unwrap();
        assert_eq!(job.max_retries(), 3);
        assert_eq!(job.with_max_retries(5).max_retries(), 5);
    }

    #[test]
    fn fresh_job_is_pending_with_no_retries() {
        let new = NewJob::new("x", Some(serde_json::json!("blob"))).unwrap();
        let now = Utc::now();
        let job = Job::from_new(JobId::new(7), new, now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_error, None);
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn zero_ceiling_is_raised_to_one_attempt() {
        let new = NewJob::new("x", Some(serde_json::json!({})))
            .unwrap()
            .with_max_retries(0);
        assert_eq!(new.max_retries(), 1);
    }

    #[test]
    fn job_serializes_type_field() {
        let new = NewJob::new("report", Some(serde_json::json!({"a": 1}))).unwrap();
        let job = Job::from_new(JobId::new(3), new, Utc::now());
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["type"], "report");
        assert_eq!(v["status"], "PENDING");
        assert_eq!(v["id"], 3);
    }
}
