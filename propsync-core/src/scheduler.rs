//! Scheduler: turns due jobs into queue messages.
//!
//! A job is due when it is idle and `next_run_at` has passed. Enqueueing a
//! job first defers its `next_run_at` by one interval, so later ticks skip it
//! while the message waits in the queue. The executor reschedules from the
//! completion time once the run finishes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::queue::JobQueue;
use crate::store::JobStore;

/// Maximum jobs enqueued per tick.
const BATCH_SIZE: usize = 500;

pub struct Scheduler {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(jobs: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, interval: Duration) -> Self {
        Self {
            jobs,
            queue,
            interval,
        }
    }

    /// Send one message per due job. Returns how many were enqueued.
    pub async fn enqueue_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .jobs
            .list_due(now, BATCH_SIZE)
            .await
            .context("Failed to list due jobs")?;

        let mut sent = 0;
        for job in &due {
            let until = chrono::Duration::from_std(job.interval)
                .ok()
                .and_then(|interval| now.checked_add_signed(interval))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            // Claimed or deferred by someone else since the listing.
            if !self.jobs.defer(job.id, now, until).await.context("Failed to defer job")? {
                continue;
            }
            self.queue
                .send(job.id)
                .await
                .with_context(|| format!("Failed to enqueue job {}", job.id))?;
            sent += 1;
        }

        if sent > 0 {
            tracing::debug!(count = sent, "enqueued due jobs");
        }
        Ok(sent)
    }

    /// Tick until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        loop {
            if let Err(e) = self.enqueue_due(Utc::now()).await {
                tracing::error!(error = %e, "Scheduler tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::store_memory::MemoryStore;
    use crate::types::*;
    use uuid::Uuid;

    fn job(next_run_at: DateTime<Utc>) -> Job {
        let mut job = Job::new(
            JobOwner::Supplier(Uuid::now_v7()),
            JobType::new("availabilities"),
            Duration::from_secs(900),
        );
        job.next_run_at = next_run_at;
        job
    }

    #[tokio::test]
    async fn only_due_jobs_are_enqueued() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let now = Utc::now();

        let due = job(now - chrono::Duration::minutes(1));
        let later = job(now + chrono::Duration::minutes(1));
        store.insert_job(due.clone()).unwrap();
        store.insert_job(later).unwrap();

        let scheduler = Scheduler::new(store.clone(), queue.clone(), Duration::from_secs(30));
        assert_eq!(scheduler.enqueue_due(now).await.unwrap(), 1);

        let batch = queue.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id, due.id);
    }

    #[tokio::test]
    async fn waiting_message_is_not_duplicated_by_later_ticks() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let now = Utc::now();
        let due = job(now - chrono::Duration::minutes(1));
        store.insert_job(due.clone()).unwrap();
        let scheduler = Scheduler::new(store.clone(), queue.clone(), Duration::from_secs(30));

        let mut enqueued = 0;
        for tick in 0..3 {
            enqueued += scheduler
                .enqueue_due(now + chrono::Duration::seconds(30 * tick))
                .await
                .unwrap();
        }

        assert_eq!(enqueued, 1);
        assert_eq!(queue.len(), 1);
        let stored = store.find(due.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run_at, now + chrono::Duration::seconds(900));

        // A message nobody picked up within an interval is sent again.
        let overdue = now + chrono::Duration::seconds(900);
        assert_eq!(scheduler.enqueue_due(overdue).await.unwrap(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let scheduler = Scheduler::new(store, queue, Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        scheduler.run(shutdown).await;
    }
}
