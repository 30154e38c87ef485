//! Re-queuer-only binary. See `bin/gateway.rs` for the note on why a
//! standalone in-memory broker instance only makes sense alongside the
//! other components in the same process.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use saga_runtime::bus::{Broker, InMemoryBroker};
use saga_runtime::config::{Config, LOG_ENV_VAR};
use saga_runtime::retry::Requeuer;

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
    let config = Arc::new(config);
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());

    let requeuer = Requeuer::new(broker, config);
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { requeuer.run(cancel).await }
    });

    tokio::signal::ctrl_c().await.ok();
    cancel.cancel();
    let _ = run.await;
    Ok(())
}
