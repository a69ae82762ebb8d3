//! Infrastructure layer: job storage, dispatch transport, the worker, config.

pub mod config;
pub mod event_bus;
pub mod jobs;

pub use config::{AppConfig, ConfigError, DispatchConfig, WorkerSettings};
