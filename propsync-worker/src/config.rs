//! Runtime configuration.
//!
//! Every setting comes from a `PROPSYNC_*` environment variable (optionally
//! seeded from `.env`) and can be overridden on the command line.

use clap::Args;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool size must be at least 1")]
    EmptyPool,

    #[error("receive batch must be at least 1")]
    EmptyBatch,

    #[error(
        "handler timeout ({timeout_secs}s) must be shorter than the queue visibility window ({visibility_secs}s)"
    )]
    TimeoutNotBelowVisibility {
        timeout_secs: u64,
        visibility_secs: u64,
    },

    #[error("PROPSYNC_DATABASE_URL must be set")]
    MissingDatabaseUrl,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerConfig {
    /// Postgres connection string
    #[arg(long, global = true, env = "PROPSYNC_DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Number of worker processes kept alive by the supervisor
    #[arg(long, global = true, env = "PROPSYNC_POOL_SIZE", default_value_t = 4)]
    pub pool_size: usize,

    /// Hard limit on one handler run, in seconds
    #[arg(long, global = true, env = "PROPSYNC_HANDLER_TIMEOUT_SECS", default_value_t = 7200)]
    pub handler_timeout_secs: u64,

    /// How long a received message stays invisible before redelivery
    #[arg(long, global = true, env = "PROPSYNC_VISIBILITY_TIMEOUT_SECS", default_value_t = 7500)]
    pub visibility_timeout_secs: u64,

    /// Long-poll wait per receive
    #[arg(long, global = true, env = "PROPSYNC_RECEIVE_WAIT_SECS", default_value_t = 20)]
    pub receive_wait_secs: u64,

    /// Messages taken per receive
    #[arg(long, global = true, env = "PROPSYNC_RECEIVE_BATCH", default_value_t = 1)]
    pub receive_batch: usize,

    /// Scheduler tick
    #[arg(long, global = true, env = "PROPSYNC_SCHEDULE_INTERVAL_SECS", default_value_t = 30)]
    pub schedule_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pool_size: 4,
            handler_timeout_secs: 7200,
            visibility_timeout_secs: 7500,
            receive_wait_secs: 20,
            receive_batch: 1,
            schedule_interval_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.receive_batch == 0 {
            return Err(ConfigError::EmptyBatch);
        }
        if self.handler_timeout_secs >= self.visibility_timeout_secs {
            return Err(ConfigError::TimeoutNotBelowVisibility {
                timeout_secs: self.handler_timeout_secs,
                visibility_secs: self.visibility_timeout_secs,
            });
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    /// The effective settings as `PROPSYNC_*` variables, so spawned workers
    /// see the supervisor's command-line overrides.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("PROPSYNC_POOL_SIZE", self.pool_size.to_string()),
            ("PROPSYNC_HANDLER_TIMEOUT_SECS", self.handler_timeout_secs.to_string()),
            ("PROPSYNC_VISIBILITY_TIMEOUT_SECS", self.visibility_timeout_secs.to_string()),
            ("PROPSYNC_RECEIVE_WAIT_SECS", self.receive_wait_secs.to_string()),
            ("PROPSYNC_RECEIVE_BATCH", self.receive_batch.to_string()),
            ("PROPSYNC_SCHEDULE_INTERVAL_SECS", self.schedule_interval_secs.to_string()),
        ];
        if let Some(url) = &self.database_url {
            env.push(("PROPSYNC_DATABASE_URL", url.clone()));
        }
        env
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }
}
