//! Assembles every component into one cancellable pipeline for standalone
//! mode. Each binary that runs a subset of components (gateway-only,
//! processor-only, ...) wires its pieces directly instead of going through
//! here; this module exists for the all-in-one development server.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::{Broker, InMemoryBroker};
use crate::cache::{run_ack_consumer, run_sweeper, ResultCache};
use crate::config::Config;
use crate::dlq::DlqReplayer;
use crate::processor::StepProcessor;
use crate::retry::Requeuer;
use crate::storage;

/// Runs every component in-process until `cancel` fires, then waits up to
/// `config.shutdown_grace()` for them to drain.
pub async fn run_standalone(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let pool = storage::init_pool(&config.db_dsn).await?;
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let cache = Arc::new(ResultCache::new(config.result_cache_ttl()));
    let cancel = CancellationToken::new();

    let processor = StepProcessor::new(pool.clone(), broker.clone(), config.clone());
    let requeuer = Requeuer::new(broker.clone(), config.clone());
    let replayer = DlqReplayer::new(broker.clone(), config.clone());

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    }));
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move { requeuer.run(cancel).await }
    }));
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move { replayer.run(cancel).await }
    }));
    tasks.push(tokio::spawn(run_ack_consumer(broker.clone(), config.clone(), cache.clone(), cancel.child_token())));
    tasks.push(tokio::spawn(run_sweeper(cache.clone(), cancel.child_token())));

    let gateway_broker = broker.clone();
    let gateway_cache = cache.clone();
    let gateway_config = config.clone();
    let gateway = tokio::spawn(async move {
        if let Err(e) = crate::gateway::serve(gateway_broker, gateway_cache, gateway_config).await {
            tracing::error!(error = %e, "gateway server exited");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    cancel.cancel();
    gateway.abort();

    let grace = config.shutdown_grace();
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!("shutdown grace period elapsed before all tasks drained");
    }

    Ok(())
}
