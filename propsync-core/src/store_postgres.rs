//! Postgres-backed job store, owner store and queue.
//!
//! Expected tables (migrations live with the catalog service):
//! - `sync_jobs(id, host_id, supplier_id, job_type, status, interval_secs,
//!   next_run_at, continuation_args jsonb)`
//! - `hosts(id, supplier_id, username)`, `suppliers(id, name)`
//! - `sync_queue(message_id, job_id, receipt, receive_count, visible_at, enqueued_at)`

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::queue::{JobQueue, QueueMessage};
use crate::store::{JobStore, OwnerStore};
use crate::types::*;

/// How often `receive` re-polls while long-polling an empty queue.
const RECEIVE_POLL: Duration = Duration::from_millis(500);

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    host_id: Option<Uuid>,
    supplier_id: Option<Uuid>,
    job_type: String,
    status: String,
    interval_secs: i64,
    next_run_at: DateTime<Utc>,
    continuation_args: serde_json::Value,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let owner = JobOwner::from_columns(row.host_id, row.supplier_id)
            .map_err(|e| anyhow!("job {}: {}", row.id, e))?;
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| anyhow!("job {}: {}", row.id, e))?;
        let interval_secs = u64::try_from(row.interval_secs)
            .map_err(|_| anyhow!("job {}: negative interval", row.id))?;
        let continuation_args = match row.continuation_args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => ContinuationArgs::new(),
            other => return Err(anyhow!("job {}: continuation_args is not an object: {}", row.id, other)),
        };
        Ok(Job {
            id: row.id,
            owner,
            job_type: JobType::new(row.job_type),
            status,
            interval: Duration::from_secs(interval_secs),
            next_run_at: row.next_run_at,
            continuation_args,
        })
    }
}

const JOB_COLUMNS: &str = "id, host_id, supplier_id, job_type, status, interval_secs, \
                           next_run_at, continuation_args";

/// Jobs, hosts and suppliers in Postgres.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load sync job")?;

        row.map(Job::try_from).transpose()
    }

    async fn update(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = $2, next_run_at = $3, continuation_args = $4
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.next_run_at)
        .bind(serde_json::Value::Object(job.continuation_args.clone()))
        .execute(&self.pool)
        .await
        .context("Failed to update sync job")?;
        Ok(())
    }

    async fn claim(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'running'
            WHERE id = $1 AND status = 'idle'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to claim sync job")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE status = 'idle' AND next_run_at <= $1 \
             ORDER BY next_run_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list due sync jobs")?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn defer(&self, id: Uuid, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET next_run_at = $3
            WHERE id = $1 AND status = 'idle' AND next_run_at <= $2
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(until)
        .execute(&self.pool)
        .await
        .context("Failed to defer sync job")?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OwnerStore for PgStore {
    async fn find_host(&self, id: Uuid) -> Result<Option<Host>> {
        let row: Option<(Uuid, Uuid, String)> =
            sqlx::query_as("SELECT id, supplier_id, username FROM hosts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load host")?;

        Ok(row.map(|(id, supplier_id, username)| Host {
            id,
            supplier_id,
            username,
        }))
    }

    async fn find_supplier(&self, id: Uuid) -> Result<Option<Supplier>> {
        let row: Option<(Uuid, String)> =
            sqlx::query_as("SELECT id, name FROM suppliers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load supplier")?;

        Ok(row.map(|(id, name)| Supplier {
            id,
            name: SupplierName::new(name),
        }))
    }
}

// ── PgQueue ──

/// Job queue with visibility windows, shared by every worker process.
///
/// Uses `FOR UPDATE SKIP LOCKED` so concurrent receivers never get the same
/// visible message.
pub struct PgQueue {
    pool: PgPool,
    visibility: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, visibility: Duration) -> Self {
        Self { pool, visibility }
    }

    async fn take_visible(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let rows: Vec<(Uuid, Uuid, i32)> = sqlx::query_as(
            r#"
            UPDATE sync_queue
            SET visible_at = now() + make_interval(secs => $1::double precision),
                receive_count = receive_count + 1,
                receipt = gen_random_uuid()
            WHERE message_id IN (
                SELECT message_id FROM sync_queue
                WHERE visible_at <= now()
                ORDER BY enqueued_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING receipt, job_id, receive_count
            "#,
        )
        .bind(self.visibility.as_secs_f64())
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to receive from sync queue")?;

        Ok(rows
            .into_iter()
            .map(|(receipt, job_id, receive_count)| QueueMessage {
                receipt,
                job_id,
                receive_count: receive_count.max(0) as u32,
            })
            .collect())
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = self.take_visible(max).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(batch);
            }
            tokio::time::sleep(remaining.min(RECEIVE_POLL)).await;
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE receipt = $1")
            .bind(message.receipt)
            .execute(&self.pool)
            .await
            .context("Failed to ack sync queue message")?;
        Ok(())
    }

    async fn send(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (message_id, job_id, receive_count, visible_at, enqueued_at)
            VALUES ($1, $2, 0, now(), now())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue sync job")?;
        Ok(())
    }
}
