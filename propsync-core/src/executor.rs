//! TaskExecutor: runs one job to completion.
//!
//! Lifecycle per delivery:
//! 1. load the job (missing → report, skip)
//! 2. skip if already running
//! 3. resolve the owner and the dispatch key
//! 4. claim the job (idle → running)
//! 5. run the handler under a hard timeout
//! 6. always: reload the job, set idle, advance `next_run_at`, and store the
//!    new continuation args on success only
//!
//! Errors the handler raises are reported, the completion step still runs,
//! and the error is returned to the caller. A failed completion is reported
//! as well; the job then stays running until an operator resets it.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::context::JobContext;
use crate::registry::HandlerRegistry;
use crate::sink::{Condition, ErrorSink};
use crate::store::{JobStore, OwnerStore};
use crate::types::*;

/// Hard wall-clock limit on one handler run.
///
/// Must stay below the queue's visibility window so a timed-out job is
/// redelivered instead of lost.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no handler registered for {0}")]
    MissingHandler(DispatchKey),

    #[error("handler for job {job_id} failed: {source:#}")]
    HandlerFailed {
        job_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("contract violation by handler {key}: {reason}")]
    ContractViolation { key: DispatchKey, reason: String },

    #[error("cannot resolve owner of job {job_id}: {reason}")]
    OwnerResolution { job_id: Uuid, reason: String },

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

/// Why a delivery was dropped without running a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    NotFound,
    AlreadyRunning,
}

/// What a successful `run` did.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Skipped(Skip),
    Finished { key: DispatchKey, outcome: Outcome },
}

impl Execution {
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Execution::Finished { outcome, .. } => Some(outcome),
            Execution::Skipped(_) => None,
        }
    }
}

pub struct TaskExecutor {
    jobs: Arc<dyn JobStore>,
    owners: Arc<dyn OwnerStore>,
    registry: Arc<HandlerRegistry>,
    sink: Arc<dyn ErrorSink>,
    timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        owners: Arc<dyn OwnerStore>,
        registry: Arc<HandlerRegistry>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            jobs,
            owners,
            registry,
            sink,
            timeout: HANDLER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the job named by `ctx.job_id()` once.
    pub async fn run(&self, ctx: &JobContext) -> Result<Execution, ExecutorError> {
        let job_id = ctx.job_id();

        let Some(job) = self.jobs.find(job_id).await.map_err(ExecutorError::Storage)? else {
            self.sink.report(Some(ctx), &Condition::JobNotFound { job_id });
            return Ok(Execution::Skipped(Skip::NotFound));
        };

        if job.status == JobStatus::Running {
            tracing::debug!(%job_id, "job already running; skipping delivery");
            ctx.record("skipped: already running");
            return Ok(Execution::Skipped(Skip::AlreadyRunning));
        }

        let owner = self.resolve_owner(&job).await?;
        let key = DispatchKey::new(job.job_type.clone(), owner.supplier().name.clone());

        if !self.jobs.claim(job_id).await.map_err(ExecutorError::Storage)? {
            tracing::debug!(%job_id, %key, "lost claim race; skipping delivery");
            ctx.record("skipped: claimed by another worker");
            return Ok(Execution::Skipped(Skip::AlreadyRunning));
        }
        ctx.record(format!("claimed for {key}"));

        let started = Instant::now();
        tracing::info!(%job_id, %key, correlation_id = %ctx.correlation_id(), "running job");

        let result = self
            .invoke(ctx, &key, &owner, &job.continuation_args)
            .await;

        if let Err(err) = &result {
            self.sink.report(
                Some(ctx),
                &Condition::HandlerFailed {
                    job_id,
                    error: err.to_string(),
                },
            );
        }

        let mut violation = None;
        let next_args = match &result {
            Ok(Outcome::Success { value }) => match coerce_args(value) {
                Ok(args) => Some(args),
                Err(reason) => {
                    violation = Some(ExecutorError::ContractViolation {
                        key: key.clone(),
                        reason,
                    });
                    None
                }
            },
            _ => None,
        };

        if let Err(err) = self.complete(ctx, job_id, next_args).await {
            self.sink.report(
                Some(ctx),
                &Condition::CompletionFailed {
                    job_id,
                    error: err.to_string(),
                },
            );
            if result.is_ok() && violation.is_none() {
                return Err(err);
            }
        }

        if let Some(violation) = violation {
            return Err(violation);
        }

        let outcome = result?;
        tracing::info!(
            %job_id,
            %key,
            success = outcome.is_success(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        Ok(Execution::Finished { key, outcome })
    }

    async fn resolve_owner(&self, job: &Job) -> Result<Owner, ExecutorError> {
        let unresolved = |reason: String| ExecutorError::OwnerResolution {
            job_id: job.id,
            reason,
        };

        match job.owner {
            JobOwner::Host(host_id) => {
                let host = self
                    .owners
                    .find_host(host_id)
                    .await
                    .map_err(ExecutorError::Storage)?
                    .ok_or_else(|| unresolved(format!("host {host_id} not found")))?;
                let supplier = self
                    .owners
                    .find_supplier(host.supplier_id)
                    .await
                    .map_err(ExecutorError::Storage)?
                    .ok_or_else(|| {
                        unresolved(format!(
                            "supplier {} of host {host_id} not found",
                            host.supplier_id
                        ))
                    })?;
                Ok(Owner::Host { host, supplier })
            }
            JobOwner::Supplier(supplier_id) => {
                let supplier = self
                    .owners
                    .find_supplier(supplier_id)
                    .await
                    .map_err(ExecutorError::Storage)?
                    .ok_or_else(|| unresolved(format!("supplier {supplier_id} not found")))?;
                Ok(Owner::Supplier(supplier))
            }
        }
    }

    /// Run the handler on its own task so the timeout can abort it and a
    /// panic surfaces as an error instead of unwinding the worker.
    async fn invoke(
        &self,
        ctx: &JobContext,
        key: &DispatchKey,
        owner: &Owner,
        args: &ContinuationArgs,
    ) -> Result<Outcome, ExecutorError> {
        let job_id = ctx.job_id();
        let handler = self
            .registry
            .lookup(key)
            .ok_or_else(|| ExecutorError::MissingHandler(key.clone()))?;

        let task = tokio::spawn({
            let ctx = ctx.clone();
            let owner = owner.clone();
            let args = args.clone();
            async move { handler.run(&ctx, &owner, &args).await }
        });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                abort.abort();
                self.sink.report(
                    Some(ctx),
                    &Condition::HandlerTimeout {
                        job_id,
                        key: key.clone(),
                        limit_secs: self.timeout.as_secs(),
                    },
                );
                Ok(Outcome::timeout(self.timeout))
            }
            Ok(Err(join_err)) => Err(ExecutorError::HandlerFailed {
                job_id,
                source: anyhow!("handler task aborted: {join_err}"),
            }),
            Ok(Ok(Err(source))) => Err(ExecutorError::HandlerFailed { job_id, source }),
            Ok(Ok(Ok(outcome))) => {
                if let Outcome::Error { code, message } = &outcome {
                    self.sink.report(
                        Some(ctx),
                        &Condition::HandlerError {
                            job_id,
                            key: key.clone(),
                            code: code.clone(),
                            message: message.clone(),
                        },
                    );
                }
                Ok(outcome)
            }
        }
    }

    /// Completion bookkeeping. The job may have been deleted meanwhile.
    async fn complete(
        &self,
        ctx: &JobContext,
        job_id: Uuid,
        next_args: Option<ContinuationArgs>,
    ) -> Result<(), ExecutorError> {
        let Some(mut job) = self.jobs.find(job_id).await.map_err(ExecutorError::Storage)? else {
            ctx.record("job vanished before completion");
            return Ok(());
        };

        let now = Utc::now();
        job.next_run_at = chrono::Duration::from_std(job.interval)
            .ok()
            .and_then(|interval| now.checked_add_signed(interval))
            .unwrap_or_else(|| {
                tracing::warn!(
                    %job_id,
                    interval_secs = job.interval.as_secs(),
                    "interval overflows the calendar; parking job"
                );
                DateTime::<Utc>::MAX_UTC
            });
        job.status = JobStatus::Idle;
        let advanced = next_args.is_some();
        if let Some(args) = next_args {
            job.continuation_args = args;
        }

        self.jobs.update(&job).await.map_err(ExecutorError::Storage)?;
        ctx.record(if advanced {
            "completed; continuation advanced"
        } else {
            "completed; continuation unchanged"
        });
        Ok(())
    }
}

/// A success value must be a flat record; null means "no state".
fn coerce_args(value: &Value) -> Result<ContinuationArgs, String> {
    match value {
        Value::Null => Ok(ContinuationArgs::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(format!(
            "success value must be a key/value record, got {}",
            json_kind(other)
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
