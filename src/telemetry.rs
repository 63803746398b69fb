use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

static INIT: OnceLock<()> = OnceLock::new();

const DEFAULT_FILTER: &str = "info,ca_server=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(env_filter())
            .try_init();
    });
}

/// Subscriber for tests: output goes through the test harness capture.
pub fn init_test_tracing() {
    let _ = INIT.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(env_filter())
            .try_init();
    });
}
