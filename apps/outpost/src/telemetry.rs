use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber. `RUST_LOG` picks the filter and
/// defaults to `info`; `OUTPOST_LOG_TARGETS=1` adds module targets to each
/// line, which helps when turning on `debug` for a single module.
pub fn init() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(env_truthy("OUTPOST_LOG_TARGETS")))
        .try_init()
        .context("failed to initialise tracing subscriber")
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).map(|val| is_truthy(&val)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
