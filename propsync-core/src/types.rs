use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Opaque state persisted between runs of a job (diff cursors, page tokens).
///
/// Always a flat record: the top level is a JSON object.
pub type ContinuationArgs = Map<String, Value>;

// ─── Job ──────────────────────────────────────────────────────

/// Execution status of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The owner a job is bound to. Exactly one, never both, never neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "owner_kind", content = "owner_id", rename_all = "lowercase")]
pub enum JobOwner {
    Host(Uuid),
    Supplier(Uuid),
}

impl JobOwner {
    /// Build from the two nullable persisted columns.
    pub fn from_columns(host_id: Option<Uuid>, supplier_id: Option<Uuid>) -> Result<Self, String> {
        match (host_id, supplier_id) {
            (Some(host), None) => Ok(Self::Host(host)),
            (None, Some(supplier)) => Ok(Self::Supplier(supplier)),
            (Some(_), Some(_)) => Err("job has both host_id and supplier_id set".to_string()),
            (None, None) => Err("job has neither host_id nor supplier_id set".to_string()),
        }
    }

    pub fn host_id(&self) -> Option<Uuid> {
        match self {
            Self::Host(id) => Some(*id),
            Self::Supplier(_) => None,
        }
    }

    pub fn supplier_id(&self) -> Option<Uuid> {
        match self {
            Self::Supplier(id) => Some(*id),
            Self::Host(_) => None,
        }
    }
}

/// Kind of synchronization a job performs ("metadata", "availabilities", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A periodic synchronization task bound to one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner: JobOwner,
    pub job_type: JobType,
    pub status: JobStatus,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub next_run_at: DateTime<Utc>,
    pub continuation_args: ContinuationArgs,
}

impl Job {
    /// A fresh idle job due immediately.
    pub fn new(owner: JobOwner, job_type: JobType, interval: Duration) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner,
            job_type,
            status: JobStatus::Idle,
            interval,
            next_run_at: Utc::now(),
            continuation_args: ContinuationArgs::new(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Idle && self.next_run_at <= now
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

// ─── Owners ───────────────────────────────────────────────────

/// Name a supplier registers its handlers under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SupplierName(String);

impl SupplierName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SupplierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A third-party data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
    pub id: Uuid,
    pub name: SupplierName,
}

/// A property manager account hosted on a supplier's platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub supplier_id: Uuid,
    pub username: String,
}

/// Resolved owner passed to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Owner {
    Host { host: Host, supplier: Supplier },
    Supplier(Supplier),
}

impl Owner {
    /// The supplier whose name selects the handler.
    pub fn supplier(&self) -> &Supplier {
        match self {
            Owner::Host { supplier, .. } => supplier,
            Owner::Supplier(supplier) => supplier,
        }
    }

    pub fn host(&self) -> Option<&Host> {
        match self {
            Owner::Host { host, .. } => Some(host),
            Owner::Supplier(_) => None,
        }
    }
}

// ─── Dispatch ─────────────────────────────────────────────────

/// Registry key: job type plus the resolved supplier's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchKey {
    pub job_type: JobType,
    pub supplier: SupplierName,
}

impl DispatchKey {
    pub fn new(job_type: JobType, supplier: SupplierName) -> Self {
        Self { job_type, supplier }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job_type, self.supplier)
    }
}

// ─── Outcome ──────────────────────────────────────────────────

/// Error code attached to a timed-out handler run.
pub const TIMEOUT_CODE: &str = "timeout";

/// Result contract between handlers, the executor and callers.
///
/// `Success` carries the next continuation args; it must be a JSON object
/// (or null, meaning empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Success {
        value: Value,
    },
    Error {
        code: String,
        message: Option<String>,
    },
}

impl Outcome {
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success {
            value: value.into(),
        }
    }

    /// Success that carries no continuation state.
    pub fn done() -> Self {
        Self::Success { value: Value::Null }
    }

    pub fn error(code: impl Into<String>, message: Option<String>) -> Self {
        Self::Error {
            code: code.into(),
            message,
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::error(
            TIMEOUT_CODE,
            Some(format!("handler exceeded {}s", limit.as_secs())),
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Error { code, .. } => Some(code),
            Self::Success { .. } => None,
        }
    }
}
