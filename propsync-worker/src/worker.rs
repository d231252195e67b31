//! Worker: the queue-polling loop run inside each pool process.
//!
//! Strictly serial: one message at a time. A shutdown request while idle
//! stops the loop at once; while busy it is honoured only after the
//! in-flight job finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use propsync_core::{
    Condition, ErrorSink, Execution, JobContext, JobQueue, QueueMessage, TaskExecutor,
};

use crate::signals::ShutdownSignals;

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// Busy/shutdown flags shared between the poll loop and the signal listener.
#[derive(Debug, Default)]
pub struct WorkerState {
    busy: AtomicBool,
    shutting_down: AtomicBool,
    idle_stop: CancellationToken,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop now if idle, otherwise after the current job.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if !self.busy.load(Ordering::SeqCst) {
            self.idle_stop.cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

/// Route every SIGINT/SIGTERM/SIGQUIT to `state`.
pub fn spawn_signal_listener(state: Arc<WorkerState>) -> std::io::Result<JoinHandle<()>> {
    let mut signals = ShutdownSignals::install()?;
    Ok(tokio::spawn(async move {
        loop {
            let name = signals.recv().await;
            tracing::info!(signal = name, busy = state.is_busy(), "worker received shutdown signal");
            state.request_shutdown();
        }
    }))
}

pub struct Worker {
    slot: usize,
    queue: Arc<dyn JobQueue>,
    executor: Arc<TaskExecutor>,
    sink: Arc<dyn ErrorSink>,
    state: Arc<WorkerState>,
    batch: usize,
    wait: Duration,
}

impl Worker {
    pub fn new(
        slot: usize,
        queue: Arc<dyn JobQueue>,
        executor: Arc<TaskExecutor>,
        sink: Arc<dyn ErrorSink>,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            slot,
            queue,
            executor,
            sink,
            state,
            batch: 1,
            wait: Duration::from_secs(20),
        }
    }

    pub fn with_receive(mut self, batch: usize, wait: Duration) -> Self {
        self.batch = batch.max(1);
        self.wait = wait;
        self
    }

    pub fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    /// Poll until shutdown. Returns the number of messages handled.
    pub async fn run(&self) -> u64 {
        let span = tracing::info_span!("worker", slot = self.slot);
        self.poll_loop().instrument(span).await
    }

    async fn poll_loop(&self) -> u64 {
        tracing::info!("Worker started");
        let mut handled = 0;

        loop {
            if self.state.is_shutting_down() {
                break;
            }

            let received = tokio::select! {
                r = self.queue.receive(self.batch, self.wait) => r,
                _ = self.state.idle_stop.cancelled() => break,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    self.report_loop_error(None, &e);
                    tokio::select! {
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                        _ = self.state.idle_stop.cancelled() => break,
                    }
                    continue;
                }
            };

            for message in messages {
                // Unprocessed messages come back after the visibility window.
                if self.state.is_shutting_down() {
                    tracing::info!("Worker shutting down");
                    return handled;
                }
                self.state.set_busy(true);
                self.handle(&message).await;
                self.state.set_busy(false);
                handled += 1;
            }
        }

        tracing::info!(handled, "Worker stopped");
        handled
    }

    async fn handle(&self, message: &QueueMessage) {
        let ctx = JobContext::new(message.job_id);
        let span = tracing::info_span!(
            "job",
            job_id = %message.job_id,
            correlation_id = %ctx.correlation_id(),
            receive_count = message.receive_count
        );

        async {
            match self.executor.run(&ctx).await {
                Ok(execution) => {
                    if let Execution::Finished { outcome, .. } = &execution {
                        tracing::debug!(success = outcome.is_success(), "delivery handled");
                    }
                    if let Err(e) = self.queue.ack(message).await {
                        self.report_loop_error(Some(&ctx), &e);
                    }
                }
                Err(e) => {
                    // Not acked: the queue redelivers after the visibility window.
                    self.report_loop_error(Some(&ctx), &e);
                }
            }
        }
        .instrument(span)
        .await
    }

    fn report_loop_error(&self, ctx: Option<&JobContext>, error: &dyn std::fmt::Display) {
        self.sink.report(
            ctx,
            &Condition::WorkerLoop {
                slot: self.slot,
                error: error.to_string(),
            },
        );
    }
}
