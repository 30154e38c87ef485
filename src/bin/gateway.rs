//! Gateway-only binary. Note: since the only `Broker` implementation
//! shipped today is in-process, this binary is useful for local
//! development against `saga-standalone`'s components only when compiled
//! into the same process tree that shares a broker instance (see
//! `runtime::run_standalone`). A wire-level `Broker` implementation would
//! let this binary run independently against a real cluster without any
//! change above the `bus` module.

use std::sync::Arc;

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use saga_runtime::bus::{Broker, InMemoryBroker};
use saga_runtime::cache::ResultCache;
use saga_runtime::config::{Config, LOG_ENV_VAR};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().map_err(|e| {
        error!(error = %e, "failed to load configuration");
        e.to_string()
    })?;
    let config = Arc::new(config);
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let cache = Arc::new(ResultCache::new(config.result_cache_ttl()));

    saga_runtime::gateway::serve(broker, cache, config).await
}
