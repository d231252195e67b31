use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence for job records.
///
/// Jobs are created and deleted outside this crate; a record may vanish
/// between the start and the end of a run, so every read returns `Option`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<Job>>;

    /// Overwrite a job record. Updating a job that no longer exists is a no-op.
    async fn update(&self, job: &Job) -> Result<()>;

    /// Atomically move a job from idle to running.
    ///
    /// Returns false if the job is missing or was not idle.
    async fn claim(&self, id: Uuid) -> Result<bool>;

    /// Idle jobs whose `next_run_at` is at or before `now`.
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Atomically move `next_run_at` of an idle job that is due at `now` to
    /// `until`.
    ///
    /// Returns false if the job is missing, running or no longer due.
    async fn defer(&self, id: Uuid, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<bool>;
}

/// Lookup of the hosts and suppliers jobs are bound to.
#[async_trait]
pub trait OwnerStore: Send + Sync {
    async fn find_host(&self, id: Uuid) -> Result<Option<Host>>;
    async fn find_supplier(&self, id: Uuid) -> Result<Option<Supplier>>;
}
