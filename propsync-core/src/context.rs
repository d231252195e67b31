use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One entry in a job's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Per-job tracing context, threaded Executor → Handler → Sink.
///
/// Created fresh for every delivery. Clones share the same event log so a
/// handler running on its own task still appends to the executor's context.
#[derive(Debug, Clone)]
pub struct JobContext {
    correlation_id: Uuid,
    job_id: Uuid,
    events: Arc<Mutex<Vec<ContextEvent>>>,
}

impl JobContext {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            correlation_id: Uuid::now_v7(),
            job_id,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn record(&self, message: impl Into<String>) {
        let event = ContextEvent {
            at: Utc::now(),
            message: message.into(),
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Snapshot of the log so far.
    pub fn events(&self) -> Vec<ContextEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_log() {
        let ctx = JobContext::new(Uuid::now_v7());
        let handler_ctx = ctx.clone();
        ctx.record("claimed");
        handler_ctx.record("fetched 12 listings");

        let messages: Vec<_> = ctx.events().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["claimed", "fetched 12 listings"]);
        assert_eq!(ctx.correlation_id(), handler_ctx.correlation_id());
    }

    #[test]
    fn fresh_contexts_get_distinct_correlation_ids() {
        let job_id = Uuid::now_v7();
        assert_ne!(
            JobContext::new(job_id).correlation_id(),
            JobContext::new(job_id).correlation_id()
        );
    }
}
