//! Configuration loading and representation.
//!
//! Everything comes from environment variables. Unset variables take their
//! default; set-but-malformed variables are an error rather than silently
//! falling back.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use jobforge_core::RetryPolicy;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://db/jobs.db?mode=rwc";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_DISPATCH_STREAM: &str = "job-events";
pub const DEFAULT_DISPATCH_GROUP: &str = "job-workers";
pub const DEFAULT_DISPATCH_CONSUMER: &str = "worker";
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);
pub const DEFAULT_SIMULATED_WORK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Where job ids are dispatched when running against durable infrastructure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub redis_url: String,
    /// Stream key (the topic)
    pub stream: String,
    /// Consumer group shared by all workers
    pub group: String,
    /// This process's consumer name within the group. Must survive a
    /// restart for the process to find its own unacknowledged deliveries.
    pub consumer: String,
    /// How long a delivery may sit unacknowledged before another consumer
    /// takes it over
    pub claim_idle: Duration,
}

/// Worker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Run a worker inside the API process
    pub embedded: bool,
    /// Duration of the simulated unit of work
    pub simulated_work: Duration,
}

impl WorkerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, self.retry_base_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// SQLite + Redis Streams instead of the in-memory store and channel
    pub persistent: bool,
    pub database_url: String,
    pub dispatch: DispatchConfig,
    pub worker: WorkerSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let persistent = parse_or(&lookup, "USE_PERSISTENT_STORES", false)?;

        let dispatch = DispatchConfig {
            redis_url: string_or(&lookup, "REDIS_URL", DEFAULT_REDIS_URL),
            stream: string_or(&lookup, "DISPATCH_STREAM", DEFAULT_DISPATCH_STREAM),
            group: string_or(&lookup, "DISPATCH_GROUP", DEFAULT_DISPATCH_GROUP),
            consumer: lookup("DISPATCH_CONSUMER")
                .or_else(|| lookup("HOSTNAME").map(|host| format!("worker-{host}")))
                .unwrap_or_else(|| DEFAULT_DISPATCH_CONSUMER.to_string()),
            claim_idle: positive_millis(&lookup, "DISPATCH_CLAIM_IDLE_MS", DEFAULT_CLAIM_IDLE)?,
        };

        // At least one attempt must be allowed.
        let max_retries: u32 = parse_or(&lookup, "MAX_RETRIES", RetryPolicy::DEFAULT_MAX_RETRIES)?;
        if max_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_RETRIES",
                value: "0".to_string(),
            });
        }

        let worker = WorkerSettings {
            max_retries,
            retry_base_delay: Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 0)?),
            // In-memory mode has no way to reach a separate worker process.
            embedded: parse_or(&lookup, "EMBEDDED_WORKER", !persistent)?,
            simulated_work: match lookup("SIMULATED_WORK_MS") {
                Some(raw) => Duration::from_millis(parse("SIMULATED_WORK_MS", &raw)?),
                None => DEFAULT_SIMULATED_WORK,
            },
        };

        Ok(Self {
            bind_addr: parse_or(
                &lookup,
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            persistent,
            database_url: string_or(&lookup, "DATABASE_URL", DEFAULT_DATABASE_URL),
            dispatch,
            worker,
        })
    }
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn positive_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(key) {
        Some(raw) => match parse::<u64>(key, &raw)? {
            0 => Err(ConfigError::Invalid { key, value: raw }),
            ms => Ok(Duration::from_millis(ms)),
        },
        None => Ok(default),
    }
}

fn parse<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}
