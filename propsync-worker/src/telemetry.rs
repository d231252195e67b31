use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,propsync_core=debug,propsync_worker=debug";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the fmt subscriber once per process. Honours `RUST_LOG`.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}
