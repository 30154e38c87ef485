//! All-in-one development binary: runs the gateway, step processor,
//! re-queuer, dlq replayer, and result cache in a single process against
//! the in-memory broker and an on-disk or in-memory SQLite store.

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use saga_runtime::config::{Config, LOG_ENV_VAR};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().map_err(|e| {
        error!(error = %e, "failed to load configuration");
        e
    })?;

    saga_runtime::runtime::run_standalone(config).await
}
