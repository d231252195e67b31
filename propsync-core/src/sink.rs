//! Fire-and-forget error/telemetry sink.

use std::sync::Mutex;
use uuid::Uuid;

use crate::context::JobContext;
use crate::types::DispatchKey;

/// A condition worth reporting. Nothing is ever read back from the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    JobNotFound {
        job_id: Uuid,
    },
    HandlerTimeout {
        job_id: Uuid,
        key: DispatchKey,
        limit_secs: u64,
    },
    /// The handler returned an error outcome.
    HandlerError {
        job_id: Uuid,
        key: DispatchKey,
        code: String,
        message: Option<String>,
    },
    /// The handler (or dispatch around it) raised instead of returning.
    HandlerFailed {
        job_id: Uuid,
        error: String,
    },
    /// The job could not be set idle again after its run.
    CompletionFailed {
        job_id: Uuid,
        error: String,
    },
    /// An error escaped one iteration of a worker's poll loop.
    WorkerLoop {
        slot: usize,
        error: String,
    },
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobNotFound { .. } => "job_not_found",
            Self::HandlerTimeout { .. } => "handler_timeout",
            Self::HandlerError { .. } => "handler_error",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::CompletionFailed { .. } => "completion_failed",
            Self::WorkerLoop { .. } => "worker_loop",
        }
    }
}

pub trait ErrorSink: Send + Sync {
    /// `ctx` is absent for conditions raised outside any job.
    fn report(&self, ctx: Option<&JobContext>, condition: &Condition);
}

/// Writes every condition to the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, ctx: Option<&JobContext>, condition: &Condition) {
        if let Some(ctx) = ctx {
            ctx.record(format!("reported {}", condition.kind()));
        }
        let correlation_id = ctx.map(|c| c.correlation_id().to_string());
        let correlation_id = correlation_id.as_deref().unwrap_or("-");
        match condition {
            Condition::JobNotFound { job_id } => {
                tracing::warn!(%job_id, correlation_id, "job not found; dropping message");
            }
            Condition::HandlerTimeout {
                job_id,
                key,
                limit_secs,
            } => {
                tracing::error!(%job_id, %key, limit_secs, correlation_id, "handler timed out");
            }
            Condition::HandlerError {
                job_id,
                key,
                code,
                message,
            } => {
                tracing::warn!(
                    %job_id,
                    %key,
                    code = %code,
                    message = message.as_deref().unwrap_or(""),
                    correlation_id,
                    "handler returned error outcome"
                );
            }
            Condition::HandlerFailed { job_id, error } => {
                tracing::error!(%job_id, error = %error, correlation_id, "handler failed");
            }
            Condition::CompletionFailed { job_id, error } => {
                tracing::error!(%job_id, error = %error, correlation_id, "job left running; completion failed");
            }
            Condition::WorkerLoop { slot, error } => {
                tracing::error!(slot, error = %error, "worker loop iteration failed");
            }
        }
    }
}

/// Records conditions in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    reported: Mutex<Vec<Condition>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.reported.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.conditions().iter().filter(|c| c.kind() == kind).count()
    }
}

impl ErrorSink for MemorySink {
    fn report(&self, ctx: Option<&JobContext>, condition: &Condition) {
        if let Some(ctx) = ctx {
            ctx.record(format!("reported {}", condition.kind()));
        }
        if let Ok(mut reported) = self.reported.lock() {
            reported.push(condition.clone());
        }
    }
}
