//! Supervisor: keeps a fixed pool of worker processes alive.
//!
//! Each worker is an independent OS process, so a crashing job cannot take
//! down its neighbours. A worker that exits for any reason is replaced in
//! the same slot. The first shutdown signal drains the pool (SIGTERM to every
//! worker, then wait for all of them); further signals are counted and
//! ignored.

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;

use crate::signals::ShutdownSignals;

/// Delay before retrying a slot whose worker failed to spawn.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Starts one worker process for a slot.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, slot: usize) -> std::io::Result<Child>;
}

/// Re-executes the current binary as `worker --slot N`.
pub struct CommandSpawner {
    program: PathBuf,
    env: Vec<(&'static str, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            env: Vec::new(),
        }
    }

    /// Extra environment for every worker, on top of the inherited one.
    pub fn with_env(mut self, env: Vec<(&'static str, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(program))
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, slot: usize) -> std::io::Result<Child> {
        Command::new(&self.program)
            .arg("worker")
            .arg("--slot")
            .arg(slot.to_string())
            .envs(self.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .spawn()
    }
}

/// A dead worker and its replacement.
#[derive(Debug)]
pub struct Reaped {
    pub slot: usize,
    pub old_pid: u32,
    pub new_pid: u32,
}

/// How a supervised pool ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    /// Workers reaped by the drain.
    pub drained: usize,
    /// Signals that arrived while the drain was in progress.
    pub ignored_signals: u32,
}

type Exit = (u32, usize, std::io::Result<ExitStatus>);

pub struct Supervisor<S> {
    spawner: S,
    pool_size: usize,
    /// pid → slot
    workers: HashMap<u32, usize>,
    exits: JoinSet<Exit>,
    /// Slots whose last spawn failed.
    vacant: Vec<usize>,
}

impl<S: WorkerSpawner> Supervisor<S> {
    pub fn new(spawner: S, pool_size: usize) -> Self {
        Self {
            spawner,
            pool_size,
            workers: HashMap::new(),
            exits: JoinSet::new(),
            vacant: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<_> = self.workers.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn slot_of(&self, pid: u32) -> Option<usize> {
        self.workers.get(&pid).copied()
    }

    /// Spawn one worker per slot. Slots that fail stay vacant for a later
    /// retry; the error names how many.
    pub fn spawn_pool(&mut self) -> Result<()> {
        for slot in 0..self.pool_size {
            if let Err(e) = self.spawn_slot(slot) {
                tracing::error!(slot, error = %e, "initial spawn failed");
            }
        }
        if !self.vacant.is_empty() {
            return Err(anyhow!(
                "{} of {} worker slots failed to spawn",
                self.vacant.len(),
                self.pool_size
            ));
        }
        tracing::info!(pool_size = self.pool_size, "worker pool started");
        Ok(())
    }

    fn spawn_slot(&mut self, slot: usize) -> Result<u32> {
        let spawned = self.spawner.spawn(slot).and_then(|child| {
            let pid = child
                .id()
                .ok_or_else(|| std::io::Error::other("worker exited before it was tracked"))?;
            Ok((child, pid))
        });
        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.vacant.push(slot);
                return Err(anyhow!("Failed to spawn worker for slot {slot}: {e}"));
            }
        };

        self.workers.insert(pid, slot);
        self.exits.spawn(async move {
            let status = child.wait().await;
            (pid, slot, status)
        });
        tracing::info!(slot, pid, "spawned worker");
        Ok(pid)
    }

    /// Retry every vacant slot once.
    fn fill_vacant(&mut self) {
        for slot in std::mem::take(&mut self.vacant) {
            if let Err(e) = self.spawn_slot(slot) {
                tracing::error!(slot, error = %e, "respawn failed");
            }
        }
    }

    /// Wait for any worker to exit and respawn its slot. `None` once no
    /// workers are tracked.
    pub async fn reap_one(&mut self) -> Result<Option<Reaped>> {
        let Some(joined) = self.exits.join_next().await else {
            return Ok(None);
        };
        let (old_pid, slot, status) = joined.context("Worker wait task failed")?;
        self.workers.remove(&old_pid);

        match status {
            Ok(status) => tracing::warn!(slot, pid = old_pid, %status, "worker exited; respawning"),
            Err(e) => tracing::warn!(slot, pid = old_pid, error = %e, "lost track of worker; respawning"),
        }

        let new_pid = self.spawn_slot(slot)?;
        Ok(Some(Reaped {
            slot,
            old_pid,
            new_pid,
        }))
    }

    /// SIGTERM every worker and wait until all have exited. Returns how many
    /// were reaped.
    pub async fn drain(&mut self) -> usize {
        self.vacant.clear();
        for (&pid, &slot) in &self.workers {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => tracing::warn!(slot, pid, %errno, "failed to signal worker"),
            }
        }

        let mut reaped = 0;
        while let Some(joined) = self.exits.join_next().await {
            match joined {
                Ok((pid, slot, _)) => {
                    self.workers.remove(&pid);
                    tracing::debug!(slot, pid, "worker drained");
                }
                Err(e) => tracing::warn!(error = %e, "worker wait task failed during drain"),
            }
            reaped += 1;
        }
        self.workers.clear();
        reaped
    }

    /// Supervise until the first shutdown signal, then drain and return.
    pub async fn run(self) -> Result<Shutdown> {
        let signals = ShutdownSignals::install().context("Failed to install signal handlers")?;
        Ok(self.supervise(signals).await)
    }

    async fn supervise(mut self, mut signals: ShutdownSignals) -> Shutdown {
        if let Err(e) = self.spawn_pool() {
            tracing::error!(error = %e, "initial pool incomplete");
        }

        loop {
            tokio::select! {
                name = signals.recv() => {
                    tracing::info!(signal = name, workers = self.len(), "shutdown requested; draining pool");
                    break;
                }
                reaped = self.reap_one(), if !self.exits.is_empty() => {
                    if let Err(e) = reaped {
                        tracing::error!(error = %e, "respawn failed");
                    }
                }
                _ = tokio::time::sleep(RESPAWN_BACKOFF), if !self.vacant.is_empty() => {
                    self.fill_vacant();
                }
            }
        }

        let mut ignored = 0u32;
        let drained = {
            let drain = self.drain();
            tokio::pin!(drain);
            loop {
                tokio::select! {
                    n = &mut drain => break n,
                    name = signals.recv() => {
                        ignored += 1;
                        tracing::info!(signal = name, ignored, "drain already in progress; ignoring signal");
                    }
                }
            }
        };

        tracing::info!(drained, ignored, "worker pool stopped");
        Shutdown {
            drained,
            ignored_signals: ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Long-lived stand-in for a worker process.
    struct SleepSpawner;

    impl WorkerSpawner for SleepSpawner {
        fn spawn(&self, _slot: usize) -> std::io::Result<Child> {
            Command::new("sleep").arg("30").kill_on_drop(true).spawn()
        }
    }

    /// Fails the first spawn of one slot, like a transient EAGAIN from fork.
    struct FlakySpawner {
        failing_slot: usize,
        failed: AtomicBool,
    }

    impl WorkerSpawner for FlakySpawner {
        fn spawn(&self, slot: usize) -> std::io::Result<Child> {
            if slot == self.failing_slot && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(std::io::Error::from_raw_os_error(Errno::EAGAIN as i32));
            }
            SleepSpawner.spawn(slot)
        }
    }

    fn slots<S: WorkerSpawner>(sup: &Supervisor<S>) -> BTreeSet<usize> {
        sup.pids().into_iter().filter_map(|p| sup.slot_of(p)).collect()
    }

    #[tokio::test]
    async fn failed_spawn_leaves_only_that_slot_vacant() {
        let spawner = FlakySpawner {
            failing_slot: 1,
            failed: AtomicBool::new(false),
        };
        let mut sup = Supervisor::new(spawner, 5);

        let err = sup.spawn_pool().unwrap_err();
        assert!(err.to_string().contains("1 of 5"));
        assert_eq!(sup.len(), 4);
        assert_eq!(sup.vacant, vec![1]);
        assert_eq!(slots(&sup), [0, 2, 3, 4].into_iter().collect());

        sup.fill_vacant();
        assert_eq!(sup.len(), 5);
        assert!(sup.vacant.is_empty());
        assert_eq!(slots(&sup), (0..5).collect());

        assert_eq!(sup.drain().await, 5);
    }

    #[tokio::test]
    async fn pool_of_five_has_five_distinct_workers() {
        let mut sup = Supervisor::new(SleepSpawner, 5);
        sup.spawn_pool().unwrap();

        let pids = sup.pids();
        assert_eq!(pids.len(), 5);
        assert_eq!(pids.iter().collect::<BTreeSet<_>>().len(), 5);
        assert_eq!(slots(&sup), (0..5).collect());

        assert_eq!(sup.drain().await, 5);
    }

    #[tokio::test]
    async fn killed_worker_is_replaced_in_the_same_slot() {
        let mut sup = Supervisor::new(SleepSpawner, 5);
        sup.spawn_pool().unwrap();

        let victim = sup.pids()[2];
        let victim_slot = sup.slot_of(victim).unwrap();
        kill(Pid::from_raw(victim as i32), Signal::SIGKILL).unwrap();

        let reaped = tokio::time::timeout(Duration::from_secs(5), sup.reap_one())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reaped.old_pid, victim);
        assert_eq!(reaped.slot, victim_slot);
        assert_ne!(reaped.new_pid, victim);

        assert_eq!(sup.len(), 5);
        assert_eq!(sup.slot_of(reaped.new_pid), Some(victim_slot));
        assert_eq!(sup.slot_of(victim), None);
        assert_eq!(slots(&sup), (0..5).collect());

        sup.drain().await;
    }

    #[tokio::test]
    async fn drain_terminates_every_worker() {
        let mut sup = Supervisor::new(SleepSpawner, 3);
        sup.spawn_pool().unwrap();

        let drained = tokio::time::timeout(Duration::from_secs(5), sup.drain())
            .await
            .unwrap();
        assert_eq!(drained, 3);
        assert!(sup.is_empty());
        assert!(sup.reap_one().await.unwrap().is_none());
    }
}
