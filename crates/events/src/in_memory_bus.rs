//! In-memory dispatch channel for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use jobforge_core::JobId;

use crate::bus::{ChannelError, Delivery, DispatchChannel, PublishError, Receipt, Subscription};

#[derive(Debug)]
struct Entry {
    job_id: JobId,
    acked: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// Entries from offset `base` onward. Acknowledged entries at the front
    /// are dropped.
    log: VecDeque<Entry>,
    base: u64,
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
    unavailable: bool,
}

/// In-memory append-only log with one consumer group.
///
/// - No IO
/// - The receipt of a delivery is its offset in the log
/// - Acknowledged entries are dropped once everything before them is
///   acknowledged too, so a long-running process holds only the
///   outstanding window
/// - A new subscription first replays every unacknowledged entry, which is
///   how a restarted worker sees deliveries it never finished
/// - `set_available(false)` makes `publish` fail, for exercising the
///   not-dispatched paths
#[derive(Debug, Default)]
pub struct InMemoryDispatchChannel {
    inner: Mutex<Inner>,
}

impl InMemoryDispatchChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle transport availability. While unavailable every publish fails.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = !available;
        }
    }

    /// Number of entries ever appended.
    pub fn published_count(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.base + inner.log.len() as u64)
            .unwrap_or_default()
    }

    /// Number of entries still held in memory.
    pub fn retained(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.log.len())
            .unwrap_or_default()
    }

    /// Number of entries not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.log.iter().filter(|e| !e.acked).count())
            .unwrap_or_default()
    }
}

fn delivery_at(offset: u64, job_id: JobId) -> Delivery {
    Delivery::new(job_id, Receipt::new(offset.to_string()))
}

#[async_trait]
impl DispatchChannel for InMemoryDispatchChannel {
    async fn publish(&self, job_id: JobId) -> Result<(), PublishError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PublishError::new("channel lock poisoned"))?;

        if inner.unavailable {
            return Err(PublishError::new("channel unavailable"));
        }

        let offset = inner.base + inner.log.len() as u64;
        inner.log.push_back(Entry {
            job_id,
            acked: false,
        });

        // Drop any dead subscribers while publishing.
        let delivery = delivery_at(offset, job_id);
        inner
            .subscribers
            .retain(|tx| tx.send(delivery.clone()).is_ok());

        debug!(job_id = %job_id, offset, "published to in-memory channel");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, ChannelError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChannelError::Subscribe("channel lock poisoned".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for (i, entry) in inner.log.iter().enumerate() {
            if !entry.acked {
                // Receiver is alive: it is in scope right here.
                let _ = tx.send(delivery_at(inner.base + i as u64, entry.job_id));
            }
        }
        inner.subscribers.push(tx);

        Ok(Subscription::from_unbounded(rx))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let offset: u64 = delivery
            .receipt
            .as_str()
            .parse()
            .map_err(|_| ChannelError::Ack(format!("bad receipt: {}", delivery.receipt.as_str())))?;

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChannelError::Ack("channel lock poisoned".to_string()))?;

        // Already acknowledged and compacted away.
        if offset < inner.base {
            return Ok(());
        }

        let index = usize::try_from(offset - inner.base)
            .map_err(|_| ChannelError::Ack(format!("unknown receipt: {offset}")))?;
        match inner.log.get_mut(index) {
            Some(entry) if entry.job_id == delivery.job_id => entry.acked = true,
            _ => return Err(ChannelError::Ack(format!("unknown receipt: {offset}"))),
        }

        while inner.log.front().is_some_and(|e| e.acked) {
            inner.log.pop_front();
            inner.base += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::RecvTimeoutError;

    const TICK: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let channel = InMemoryDispatchChannel::new();
        let mut sub = channel.subscribe().await.unwrap();

        for i in [3, 1, 2] {
            channel.publish(JobId::new(i)).await.unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(d) = sub.recv_timeout(TICK).await {
            seen.push(d.job_id.get());
        }
        assert_eq!(seen, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn republished_id_lands_at_the_tail() {
        let channel = InMemoryDispatchChannel::new();
        let mut sub = channel.subscribe().await.unwrap();

        channel.publish(JobId::new(1)).await.unwrap();
        channel.publish(JobId::new(2)).await.unwrap();
        let first = sub.recv_timeout(TICK).await.unwrap();
        channel.publish(first.job_id).await.unwrap();

        assert_eq!(sub.recv_timeout(TICK).await.unwrap().job_id, JobId::new(2));
        assert_eq!(sub.recv_timeout(TICK).await.unwrap().job_id, JobId::new(1));
    }

    #[tokio::test]
    async fn unavailable_channel_rejects_publish() {
        let channel = InMemoryDispatchChannel::new();
        let mut sub = channel.subscribe().await.unwrap();

        channel.set_available(false);
        assert!(channel.publish(JobId::new(1)).await.is_err());
        assert_eq!(channel.published_count(), 0);
        assert_eq!(sub.recv_timeout(TICK).await, Err(RecvTimeoutError::Timeout));

        channel.set_available(true);
        channel.publish(JobId::new(2)).await.unwrap();
        assert_eq!(sub.recv_timeout(TICK).await.unwrap().job_id, JobId::new(2));
    }

    #[tokio::test]
    async fn unacked_deliveries_are_replayed_to_new_subscription() {
        let channel = InMemoryDispatchChannel::new();
        channel.publish(JobId::new(1)).await.unwrap();
        channel.publish(JobId::new(2)).await.unwrap();

        let mut first = channel.subscribe().await.unwrap();
        let d1 = first.recv_timeout(TICK).await.unwrap();
        channel.ack(&d1).await.unwrap();
        let _d2 = first.recv_timeout(TICK).await.unwrap();
        drop(first);

        // Simulated restart: only the unacknowledged id comes back.
        let mut second = channel.subscribe().await.unwrap();
        assert_eq!(second.recv_timeout(TICK).await.unwrap().job_id, JobId::new(2));
        assert_eq!(second.recv_timeout(TICK).await, Err(RecvTimeoutError::Timeout));
        assert_eq!(channel.unacked(), 1);
    }

    #[tokio::test]
    async fn ack_rejects_foreign_receipts() {
        let channel = InMemoryDispatchChannel::new();
        channel.publish(JobId::new(1)).await.unwrap();

        let bogus = Delivery::new(JobId::new(9), Receipt::new("0"));
        assert!(channel.ack(&bogus).await.is_err());

        let garbage = Delivery::new(JobId::new(1), Receipt::new("x"));
        assert!(channel.ack(&garbage).await.is_err());
    }

    #[tokio::test]
    async fn acknowledged_prefix_is_released() {
        let channel = InMemoryDispatchChannel::new();
        let mut sub = channel.subscribe().await.unwrap();
        for i in 1..=3 {
            channel.publish(JobId::new(i)).await.unwrap();
        }

        let d1 = sub.recv_timeout(TICK).await.unwrap();
        let d2 = sub.recv_timeout(TICK).await.unwrap();
        let d3 = sub.recv_timeout(TICK).await.unwrap();

        // A gap at the front keeps everything behind it.
        channel.ack(&d2).await.unwrap();
        assert_eq!(channel.retained(), 3);

        channel.ack(&d1).await.unwrap();
        channel.ack(&d3).await.unwrap();
        assert_eq!(channel.retained(), 0);
        assert_eq!(channel.unacked(), 0);
        assert_eq!(channel.published_count(), 3);

        // Acking a released entry again is harmless.
        channel.ack(&d1).await.unwrap();

        channel.publish(JobId::new(4)).await.unwrap();
        let d4 = sub.recv_timeout(TICK).await.unwrap();
        assert_eq!(d4.receipt.as_str(), "3");
        channel.ack(&d4).await.unwrap();
        assert_eq!(channel.retained(), 0);
        assert_eq!(channel.published_count(), 4);
    }

    #[tokio::test]
    async fn replay_after_compaction_keeps_offsets() {
        let channel = InMemoryDispatchChannel::new();
        channel.publish(JobId::new(1)).await.unwrap();
        channel.publish(JobId::new(2)).await.unwrap();

        let mut first = channel.subscribe().await.unwrap();
        let d1 = first.recv_timeout(TICK).await.unwrap();
        channel.ack(&d1).await.unwrap();
        drop(first);

        let mut second = channel.subscribe().await.unwrap();
        let d2 = second.recv_timeout(TICK).await.unwrap();
        assert_eq!(d2.job_id, JobId::new(2));
        assert_eq!(d2.receipt.as_str(), "1");
        channel.ack(&d2).await.unwrap();
        assert_eq!(channel.retained(), 0);
    }
}
