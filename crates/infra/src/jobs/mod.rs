//! The job lifecycle: submission, storage, execution and the worker loop.
//!
//! ## Components
//!
//! - `SubmissionService`: validates input, persists a PENDING row, dispatches its id
//! - `JobStore`: the durable job table (in-memory or SQLite)
//! - `JobExecutor`: the unit of work behind a job type
//! - `Worker`: consumes ids and drives PENDING → RUNNING → DONE / PENDING / FAILED

pub mod executor;
pub mod sqlite;
pub mod store;
pub mod submission;
pub mod worker;

pub use executor::{ExecutorRegistry, FnExecutor, JobExecutor, SimulatedWork};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use submission::{SubmissionService, SubmitError, Submitted};
pub use worker::{Abandoned, Outcome, Worker, WorkerConfig, WorkerHandle, WorkerStats};
