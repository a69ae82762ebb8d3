//! Dispatch channel abstraction (mechanics only).
//!
//! The dispatch channel is an **append-only, ordered log of job ids** with a
//! single logical partition and a single consumer group:
//!
//! ```text
//! Submission ──publish(id)──┐
//!                           ▼
//!                     [ 1 | 2 | 3 | 1 ]  ──subscribe──> Worker ──ack──┐
//!                           ▲                                         │
//! Worker (retry) ──publish(id)┘   <────────────────────────────────────┘
//! ```
//!
//! ## Delivery guarantees
//!
//! - **FIFO** within the channel; retries are appended at the tail
//! - **At-least-once**: a delivery that was never acknowledged is handed out
//!   again to the next subscription (e.g. after a worker restart), so the
//!   same id may be seen more than once
//! - **No persistence of state**: the job store is the source of truth, the
//!   channel only carries identifiers
//!
//! A failed `publish` means "not dispatched". Callers must not assume the id
//! will ever reach a worker.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::{Stream, StreamExt};

use jobforge_core::JobId;

/// The transport did not accept the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

impl PublishError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Subscription or acknowledgement failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("acknowledge failed: {0}")]
    Ack(String),
}

/// Opaque transport handle identifying one delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub receipt: Receipt,
}

impl Delivery {
    pub fn new(job_id: JobId, receipt: Receipt) -> Self {
        Self { job_id, receipt }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    /// Nothing arrived within the timeout.
    Timeout,
    /// The channel side of the subscription is gone.
    Disconnected,
}

type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// A consumer's view of the channel.
///
/// Designed for a single consuming task. `recv` suspends (no busy-wait) until
/// a delivery is available.
pub struct Subscription {
    inner: DeliveryStream,
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn new(stream: impl Stream<Item = Delivery> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    pub fn from_unbounded(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self::new(UnboundedReceiverStream::new(rx))
    }

    pub fn from_receiver(rx: mpsc::Receiver<Delivery>) -> Self {
        Self::new(ReceiverStream::new(rx))
    }

    /// Wait for the next delivery. `None` once the channel side is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inner.next().await
    }

    /// Wait up to `timeout` for the next delivery.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Delivery, RecvTimeoutError> {
        match tokio::time::timeout(timeout, self.inner.next()).await {
            Ok(Some(d)) => Ok(d),
            Ok(None) => Err(RecvTimeoutError::Disconnected),
            Err(_) => Err(RecvTimeoutError::Timeout),
        }
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Ordered, at-least-once transport of job ids.
///
/// Implementations must be safe to share across tasks; submission handlers
/// and the worker publish concurrently.
#[async_trait]
pub trait DispatchChannel: Send + Sync {
    /// Append `job_id` at the tail of the log.
    async fn publish(&self, job_id: JobId) -> Result<(), PublishError>;

    /// Start consuming: unacknowledged messages first, then new ones.
    async fn subscribe(&self) -> Result<Subscription, ChannelError>;

    /// Mark a delivery as fully handled so it is not handed out again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError>;
}
