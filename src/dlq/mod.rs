//! Dead-letter replay: consumes the dead-letter topic and re-injects
//! repaired messages at their original stage.
//!
//! Publishing *to* the dead-letter topic is the retry controller's job
//! (`RetryController::route_transient`/`route_direct_to_dlq`) since it is
//! reached from the same classification decision as every other routing
//! hop. This module only owns the read side: the operator-triggered replay
//! sweep.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Broker, Subscription};
use crate::config::Config;
use crate::envelope::decode_command;

/// Replays dead-lettered messages back to their `original_topic`, optionally
/// filtered to a single trace id (the operator's usual "just this incident"
/// replay). Messages that don't match the filter are skipped — acked
/// without republish — so the sweep doesn't re-deliver unrelated failures.
pub struct DlqReplayer {
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
}

impl DlqReplayer {
    pub fn new(broker: Arc<dyn Broker>, config: Arc<Config>) -> Self {
        Self { broker, config }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut sub = match self
            .broker
            .subscribe(&self.config.dlq_topic, &self.config.consumer_group_replayer)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "replayer failed to subscribe to dlq");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dlq replayer shutting down");
                    return;
                }
                delivery = sub.recv() => {
                    let Some(delivery) = delivery else { return };
                    let msg = delivery.message.clone();

                    let Some(original_topic) = msg.headers.original_topic.clone() else {
                        warn!(key = %msg.key, "dead letter missing original_topic, skipping replay");
                        let _ = sub.commit(&delivery).await;
                        continue;
                    };

                    if let Some(filter) = &self.config.replay_filter_trace_id {
                        let matches = decode_command(&msg)
                            .map(|cmd| &cmd.trace_id == filter)
                            .unwrap_or(false);
                        if !matches {
                            let _ = sub.commit(&delivery).await;
                            continue;
                        }
                    }

                    let target = self.config.replay_target_topic.clone().unwrap_or(original_topic);
                    match self.broker.publish(&target, msg.clone()).await {
                        Ok(()) => {
                            if let Err(e) = sub.commit(&delivery).await {
                                warn!(error = %e, "failed to commit replayer offset");
                            }
                        }
                        Err(e) => {
                            warn!(target, error = %e, "failed to republish dead letter, leaving uncommitted");
                        }
                    }
                }
            }
        }
    }
}
