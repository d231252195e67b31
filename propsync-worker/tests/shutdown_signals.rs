//! Signal handling, end to end: real signals sent to this test process.
//!
//! Kept as the only test in its binary so no other test sees the signals.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};

use propsync_worker::signals::ShutdownSignals;
use propsync_worker::{spawn_signal_listener, Shutdown, Supervisor, WorkerSpawner, WorkerState};

/// Worker stand-in that shrugs off SIGTERM for a second, so the drain is
/// still running when the next signal lands.
#[derive(Default)]
struct StubbornSpawner {
    pids: Arc<Mutex<Vec<u32>>>,
}

impl WorkerSpawner for StubbornSpawner {
    fn spawn(&self, _slot: usize) -> std::io::Result<Child> {
        let child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 1")
            .kill_on_drop(true)
            .spawn()?;
        if let Some(pid) = child.id() {
            self.pids.lock().unwrap().push(pid);
        }
        Ok(child)
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn shutdown_signals_drain_supervisor_and_stop_worker() {
    // With a handler registered, SIGTERM no longer terminates this process.
    let _handlers = ShutdownSignals::install().unwrap();

    let spawner = StubbornSpawner::default();
    let spawned = spawner.pids.clone();
    let run = tokio::spawn(Supervisor::new(spawner, 3).run());

    {
        let spawned = spawned.clone();
        wait_until(move || spawned.lock().unwrap().len() == 3).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    kill(getpid(), Signal::SIGTERM).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!run.is_finished(), "drain should wait for workers ignoring SIGTERM");
    kill(getpid(), Signal::SIGTERM).unwrap();

    let shutdown = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        shutdown,
        Shutdown {
            drained: 3,
            ignored_signals: 1
        }
    );
    for &pid in spawned.lock().unwrap().iter() {
        assert_eq!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH));
    }

    // Worker side: any shutdown signal becomes a shutdown request.
    let state = Arc::new(WorkerState::new());
    let listener = spawn_signal_listener(state.clone()).unwrap();
    kill(getpid(), Signal::SIGINT).unwrap();
    {
        let state = state.clone();
        wait_until(move || state.is_shutting_down()).await;
    }
    listener.abort();
}
