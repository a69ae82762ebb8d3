use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{Job, JobId, JobStatus};
use jobforge_infra::jobs::Submitted;

// -------------------------
// Request DTOs
// -------------------------

/// `POST /jobs` body. A missing `payload` and `"payload": null` both
/// deserialize to `None` and are rejected by validation.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

impl From<Submitted> for SubmitJobResponse {
    fn from(s: Submitted) -> Self {
        Self {
            job_id: s.job_id,
            status: s.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            last_error: job.last_error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
