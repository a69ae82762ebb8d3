//! Redis Streams-backed dispatch channel (durable, at-least-once delivery).
//!
//! - **Publish**: `XADD <stream> * value <job id>`
//! - **Consume**: `XREADGROUP` within one consumer group shared by all workers
//! - **Ack**: `XACK` once the worker has resolved a delivery
//!
//! A subscription moves through three phases:
//!
//! ```text
//! History ──own pending list drained──> Claim ──sweep done──> Live
//!                                         ▲                    │
//!                                         └──── claim_idle ────┘
//! ```
//!
//! - **History**: replay this consumer's own pending list (entries delivered
//!   to it but never acknowledged, e.g. because the process crashed mid-job).
//!   The consumer name is stable across restarts for this to find anything.
//! - **Claim**: `XAUTOCLAIM` entries idle for at least `claim_idle` in any
//!   consumer's pending list, so deliveries held by a consumer that never
//!   comes back are taken over.
//! - **Live**: `XREADGROUP ... >` one entry at a time.
//!
//! Entries whose value is not a job id are logged and acknowledged so they
//! do not come back forever.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Value;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use jobforge_core::JobId;
use jobforge_events::{ChannelError, Delivery, DispatchChannel, PublishError, Receipt, Subscription};

use crate::config::DispatchConfig;

/// Field holding the job id in each stream entry.
const VALUE_FIELD: &str = "value";

/// Live reads take one entry at a time; anything read but not yet handled
/// sits in this consumer's pending list.
const LIVE_COUNT: usize = 1;
/// Page size for history replay and claim sweeps.
const PAGE: usize = 16;
/// Cursor starting an `XAUTOCLAIM` sweep, and the cursor it returns when done.
const SWEEP_START: &str = "0-0";
const BLOCK: Duration = Duration::from_secs(5);
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

#[derive(Clone)]
pub struct RedisStreamsDispatchChannel {
    client: redis::Client,
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
}

impl core::fmt::Debug for RedisStreamsDispatchChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsDispatchChannel")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("claim_idle", &self.claim_idle)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsDispatchChannel {
    /// Connect and make sure the stream and consumer group exist.
    pub async fn connect(config: &DispatchConfig) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let channel = Self {
            client,
            conn,
            stream: config.stream.clone(),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            claim_idle: config.claim_idle,
        };
        channel.ensure_consumer_group().await?;

        info!(
            stream = %channel.stream,
            group = %channel.group,
            consumer = %channel.consumer,
            "connected to dispatch stream"
        );
        Ok(channel)
    }

    /// Idempotent `XGROUP CREATE ... MKSTREAM`, starting from the beginning
    /// of the stream so entries published before the first worker started
    /// are still delivered.
    async fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }
    }

    fn reader(&self) -> StreamReader {
        StreamReader {
            stream: self.stream.clone(),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            claim_idle: self.claim_idle,
            ack_conn: self.conn.clone(),
        }
    }
}

#[async_trait]
impl DispatchChannel for RedisStreamsDispatchChannel {
    #[instrument(skip(self), fields(stream = %self.stream), err)]
    async fn publish(&self, job_id: JobId) -> Result<(), PublishError> {
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd(&self.stream, "*", &[(VALUE_FIELD, job_id.to_wire())])
            .await
            .map_err(|e| PublishError::new(format!("XADD failed: {e}")))?;

        debug!(job_id = %job_id, entry_id = %entry_id, "job dispatched");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, ChannelError> {
        // Blocking reads get their own connection so they never stall
        // publishes and acks multiplexed on the shared one.
        let read_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(LIVE_COUNT);
        tokio::spawn(self.reader().run(read_conn, tx));

        Ok(Subscription::from_receiver(rx))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .xack(&self.stream, &self.group, &[delivery.receipt.as_str()])
            .await
            .map_err(|e| ChannelError::Ack(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

/// Where a subscription's reader currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Replaying this consumer's pending list, after entry `after`.
    History { after: String },
    /// Sweeping idle pending entries, continuing from `cursor`.
    Claim { cursor: String },
    /// Blocking on new entries.
    Live,
}

impl Phase {
    fn start() -> Self {
        Phase::History {
            after: "0".to_string(),
        }
    }

    fn sweep() -> Self {
        Phase::Claim {
            cursor: SWEEP_START.to_string(),
        }
    }

    /// An empty page ends the replay.
    fn after_history(last_id: Option<&str>) -> Self {
        match last_id {
            Some(id) => Phase::History {
                after: id.to_string(),
            },
            None => Phase::sweep(),
        }
    }

    fn after_claim(next_cursor: &str) -> Self {
        if next_cursor == SWEEP_START {
            Phase::Live
        } else {
            Phase::Claim {
                cursor: next_cursor.to_string(),
            }
        }
    }
}

/// A stream entry as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawEntry {
    id: String,
    /// The `value` field, absent when the entry was deleted or malformed.
    value: Option<String>,
}

impl RawEntry {
    fn decode(&self) -> Option<Delivery> {
        let job_id = self.value.as_deref()?.parse::<JobId>().ok()?;
        Some(Delivery::new(job_id, Receipt::new(self.id.clone())))
    }
}

/// One page of an `XAUTOCLAIM` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClaimPage {
    next_cursor: String,
    entries: Vec<RawEntry>,
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// `[id, [field, value, ...]]`
fn parse_entry(value: &Value) -> Result<RawEntry, String> {
    let parts = match value {
        Value::Bulk(parts) if parts.len() == 2 => parts,
        other => return Err(format!("invalid entry: {other:?}")),
    };

    let id = value_to_string(&parts[0]).ok_or_else(|| format!("invalid entry id: {:?}", parts[0]))?;

    let value = match &parts[1] {
        Value::Bulk(fields) => fields.chunks(2).find_map(|pair| match pair {
            [key, val] if value_to_string(key).as_deref() == Some(VALUE_FIELD) => {
                value_to_string(val)
            }
            _ => None,
        }),
        _ => None,
    };

    Ok(RawEntry { id, value })
}

/// `[next_cursor, [entry, ...], (deleted ids)]`. Entries deleted from the
/// stream come back as nil and are dropped.
fn parse_autoclaim(reply: &Value) -> Result<ClaimPage, String> {
    let parts = match reply {
        Value::Bulk(parts) if parts.len() >= 2 => parts,
        other => return Err(format!("unexpected XAUTOCLAIM reply: {other:?}")),
    };

    let next_cursor =
        value_to_string(&parts[0]).ok_or_else(|| format!("invalid cursor: {:?}", parts[0]))?;

    let entries = match &parts[1] {
        Value::Bulk(items) => items
            .iter()
            .filter(|item| !matches!(item, Value::Nil))
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?,
        Value::Nil => Vec::new(),
        other => return Err(format!("invalid claimed entries: {other:?}")),
    };

    Ok(ClaimPage {
        next_cursor,
        entries,
    })
}

/// Background task feeding one subscription.
struct StreamReader {
    stream: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
    ack_conn: MultiplexedConnection,
}

impl StreamReader {
    async fn run(self, mut conn: MultiplexedConnection, tx: mpsc::Sender<Delivery>) {
        let mut phase = Phase::start();
        let mut last_sweep = Instant::now();

        while !tx.is_closed() {
            if phase == Phase::Live && last_sweep.elapsed() >= self.claim_idle {
                phase = Phase::sweep();
            }

            let step = match &phase {
                Phase::History { after } => self.read_group(&mut conn, after).await.map(|entries| {
                    let next = Phase::after_history(entries.last().map(|e| e.id.as_str()));
                    (entries, next)
                }),
                Phase::Claim { cursor } => self.claim(&mut conn, cursor).await.map(|page| {
                    let next = Phase::after_claim(&page.next_cursor);
                    (page.entries, next)
                }),
                Phase::Live => self
                    .read_group(&mut conn, ">")
                    .await
                    .map(|entries| (entries, Phase::Live)),
            };

            let (entries, next) = match step {
                Ok(step) => step,
                Err(e) => {
                    error!(stream = %self.stream, phase = ?phase, error = %e, "stream read failed");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    continue;
                }
            };

            match (&phase, &next) {
                (Phase::History { .. }, Phase::Claim { .. }) => {
                    debug!(stream = %self.stream, consumer = %self.consumer, "pending list replayed");
                }
                (Phase::Claim { .. }, Phase::Live) => last_sweep = Instant::now(),
                _ => {}
            }
            if matches!(phase, Phase::Claim { .. }) && !entries.is_empty() {
                info!(
                    stream = %self.stream,
                    consumer = %self.consumer,
                    claimed = entries.len(),
                    "claimed idle deliveries"
                );
            }
            phase = next;

            for entry in entries {
                let Some(delivery) = self.decode(&entry).await else {
                    continue;
                };
                if tx.send(delivery).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn read_group(
        &self,
        conn: &mut MultiplexedConnection,
        cursor: &str,
    ) -> redis::RedisResult<Vec<RawEntry>> {
        let live = cursor == ">";
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(if live { LIVE_COUNT } else { PAGE });
        if live {
            opts = opts.block(BLOCK.as_millis() as usize);
        }

        // BLOCK timing out replies with nil.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[cursor], &opts)
            .await?;

        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|k| k.ids)
                    .map(|entry| RawEntry {
                        value: entry.get(VALUE_FIELD),
                        id: entry.id,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn claim(
        &self,
        conn: &mut MultiplexedConnection,
        cursor: &str,
    ) -> redis::RedisResult<ClaimPage> {
        let min_idle_ms = u64::try_from(self.claim_idle.as_millis()).unwrap_or(u64::MAX);
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg(cursor)
            .arg("COUNT")
            .arg(PAGE)
            .query_async(conn)
            .await?;

        parse_autoclaim(&reply).map_err(|detail| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "bad XAUTOCLAIM reply", detail))
        })
    }

    async fn decode(&self, entry: &RawEntry) -> Option<Delivery> {
        if let Some(delivery) = entry.decode() {
            return Some(delivery);
        }

        warn!(
            stream = %self.stream,
            entry_id = %entry.id,
            value = ?entry.value,
            "undecodable dispatch message, acknowledging and skipping"
        );
        let mut conn = self.ack_conn.clone();
        let acked: redis::RedisResult<u64> =
            conn.xack(&self.stream, &self.group, &[&entry.id]).await;
        if let Err(e) = acked {
            error!(entry_id = %entry.id, error = %e, "failed to acknowledge poison message");
        }
        None
    }
}
