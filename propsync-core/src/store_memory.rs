use crate::store::{JobStore, OwnerStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory job and owner store for tests and single-process runs.
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    hosts: RwLock<HashMap<Uuid, Host>>,
    suppliers: RwLock<HashMap<Uuid, Supplier>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            suppliers: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert_job(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(|e| anyhow!("Lock: {}", e))?;
        jobs.insert(job.id, job);
        Ok(())
    }

    pub fn remove_job(&self, id: Uuid) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(jobs.remove(&id))
    }

    pub fn insert_host(&self, host: Host) -> Result<()> {
        let mut hosts = self.hosts.write().map_err(|e| anyhow!("Lock: {}", e))?;
        hosts.insert(host.id, host);
        Ok(())
    }

    pub fn insert_supplier(&self, supplier: Supplier) -> Result<()> {
        let mut suppliers = self.suppliers.write().map_err(|e| anyhow!("Lock: {}", e))?;
        suppliers.insert(supplier.id, supplier);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        let jobs = self.jobs.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(jobs.get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(|e| anyhow!("Lock: {}", e))?;
        if let Some(existing) = jobs.get_mut(&job.id) {
            *existing = job.clone();
        }
        Ok(())
    }

    async fn claim(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(|e| anyhow!("Lock: {}", e))?;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Idle => {
                job.status = JobStatus::Running;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut due: Vec<Job> = jobs.values().filter(|j| j.is_due(now)).cloned().collect();
        due.sort_by_key(|j| j.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn defer(&self, id: Uuid, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(|e| anyhow!("Lock: {}", e))?;
        match jobs.get_mut(&id) {
            Some(job) if job.is_due(now) => {
                job.next_run_at = until;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl OwnerStore for MemoryStore {
    async fn find_host(&self, id: Uuid) -> Result<Option<Host>> {
        let hosts = self.hosts.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(hosts.get(&id).cloned())
    }

    async fn find_supplier(&self, id: Uuid) -> Result<Option<Supplier>> {
        let suppliers = self.suppliers.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(suppliers.get(&id).cloned())
    }
}
