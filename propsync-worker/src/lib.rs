//! Process pool for the property sync hub: the supervisor, the
//! queue-polling worker and their configuration.

pub mod config;
pub mod process;
pub mod signals;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, WorkerConfig};
pub use supervisor::{CommandSpawner, Reaped, Shutdown, Supervisor, WorkerSpawner};
pub use worker::{spawn_signal_listener, Worker, WorkerState};
