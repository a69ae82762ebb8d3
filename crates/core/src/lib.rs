//! `jobforge-core`: job domain building blocks.
//!
//! This crate contains the **pure domain** model of a job (no I/O, no async).
//! Storage, dispatch and execution live in `jobforge-infra`.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use error::{ExecutionFailure, ValidationError};
pub use id::JobId;
pub use job::{Job, JobStatus, NewJob};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
