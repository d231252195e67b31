//! Queue port carrying job ids to workers.
//!
//! The queue owns redelivery: a received message stays invisible for the
//! visibility window and comes back unless it is acked. The executor's hard
//! timeout is always shorter than that window.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// One delivery of a job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Delivery handle used to ack.
    pub receipt: Uuid,
    pub job_id: Uuid,
    /// How many times this message has been received, including this one.
    pub receive_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Long-poll for up to `max` messages, waiting at most `wait`.
    /// Returns an empty batch when nothing arrived in time.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>>;

    /// Remove a delivered message for good.
    async fn ack(&self, message: &QueueMessage) -> Result<()>;

    async fn send(&self, job_id: Uuid) -> Result<()>;
}

// ── MemoryQueue ──

struct Entry {
    receipt: Uuid,
    job_id: Uuid,
    receive_count: u32,
    visible_at: Instant,
}

/// In-process queue with visibility-window redelivery.
pub struct MemoryQueue {
    visibility: Duration,
    entries: Mutex<VecDeque<Entry>>,
    arrived: Notify,
}

impl MemoryQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            visibility,
            entries: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
        }
    }

    /// Messages not yet acked, visible or not.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_visible(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock: {}", e))?;
        let now = Instant::now();
        let mut batch = Vec::new();
        for entry in entries.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if entry.visible_at <= now {
                entry.receipt = Uuid::now_v7();
                entry.receive_count += 1;
                entry.visible_at = now + self.visibility;
                batch.push(QueueMessage {
                    receipt: entry.receipt,
                    job_id: entry.job_id,
                    receive_count: entry.receive_count,
                });
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.take_visible(max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            // Wake on a new send, or re-check periodically for redeliveries.
            let nap = deadline
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(100));
            if nap.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = self.arrived.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock: {}", e))?;
        entries.retain(|e| e.receipt != message.receipt);
        Ok(())
    }

    async fn send(&self, job_id: Uuid) -> Result<()> {
        {
            let mut entries = self
                .entries
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock: {}", e))?;
            entries.push_back(Entry {
                receipt: Uuid::nil(),
                job_id,
                receive_count: 0,
                visible_at: Instant::now(),
            });
        }
        self.arrived.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_then_ack_removes_message() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let job_id = Uuid::now_v7();
        queue.send(job_id).await.unwrap();

        let batch = queue.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id, job_id);
        assert_eq!(batch[0].receive_count, 1);

        queue.ack(&batch[0]).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_redelivered_after_visibility_window() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.send(Uuid::now_v7()).await.unwrap();

        let first = queue.receive(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.len(), 1);

        // Invisible inside the window.
        let hidden = queue.receive(1, Duration::from_secs(5)).await.unwrap();
        assert!(hidden.is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        let again = queue.receive(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert_ne!(again[0].receipt, first[0].receipt);

        // The stale receipt no longer acks anything.
        queue.ack(&first[0]).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn empty_queue_returns_empty_batch() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let batch = queue.receive(5, Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }
}
