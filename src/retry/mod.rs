//! Retry controller and re-queuer: routes a classified failure to its next
//! delay stage (or to the dead-letter topic once every stage is spent), and
//! sleeps out each stage before handing the message back to the commands
//! topic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{self, Broker, Subscription};
use crate::config::{Config, RetryStageConfig};
use crate::envelope::{bump_attempt, set_error, set_original_topic_if_unset, BrokerMessage};
use crate::error::ProcessingError;

/// Header key stamped with the wall-clock time a message entered a retry
/// stage topic, so the re-queuer sleeps only the remaining delay instead of
/// re-counting from whenever it happens to wake and pull the message.
const STAGE_ENTERED_AT: &str = "stage_entered_at";

/// Classifies a failure and publishes the message to the appropriate next
/// hop: the next retry stage, or straight to the dead-letter topic.
pub struct RetryController {
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
}

impl RetryController {
    pub fn new(broker: Arc<dyn Broker>, config: Arc<Config>) -> Self {
        Self { broker, config }
    }

    /// Route a `Transient` failure: hop to the next stage if one remains,
    /// otherwise to the dead-letter topic.
    pub async fn route_transient(&self, mut msg: BrokerMessage, err: &ProcessingError) -> bus::Result<()> {
        set_original_topic_if_unset(&mut msg, &self.config.commands_topic);
        set_error(&mut msg, err.detail().as_str());

        let stage_index = msg.headers.attempt as usize;
        if stage_index < self.config.retry_stages.len() {
            bump_attempt(&mut msg);
            msg.headers
                .extra
                .insert(STAGE_ENTERED_AT.to_string(), Utc::now().to_rfc3339());
            let stage = &self.config.retry_stages[stage_index];
            info!(topic = %stage.topic, attempt = msg.headers.attempt, "routing transient failure to retry stage");
            self.broker.publish(&stage.topic, msg).await
        } else {
            warn!("retry stages exhausted, routing to dlq");
            self.broker.publish(&self.config.dlq_topic, msg).await
        }
    }

    /// Route a `MalformedEnvelope`/`Fatal` failure directly to the
    /// dead-letter topic, never consuming a retry stage.
    pub async fn route_direct_to_dlq(&self, mut msg: BrokerMessage, err: &ProcessingError) -> bus::Result<()> {
        set_original_topic_if_unset(&mut msg, &self.config.commands_topic);
        set_error(&mut msg, err.detail().as_str());
        self.broker.publish(&self.config.dlq_topic, msg).await
    }
}

/// One background task per retry stage: sleeps out the stage's delay (net
/// of time already spent waiting in the topic) and republishes to the
/// commands topic, preserving headers including the bumped `attempt` and
/// the stamped `original_topic`.
pub struct Requeuer {
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
}

impl Requeuer {
    pub fn new(broker: Arc<dyn Broker>, config: Arc<Config>) -> Self {
        Self { broker, config }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut handles = Vec::new();
        for stage in self.config.retry_stages.clone() {
            let broker = self.broker.clone();
            let config = self.config.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                run_stage(broker, config, stage, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn remaining_delay(msg: &BrokerMessage, stage: &RetryStageConfig) -> Duration {
    let entered_at = msg
        .headers
        .extra
        .get(STAGE_ENTERED_AT)
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok());

    match entered_at {
        Some(entered_at) => {
            let elapsed = Utc::now()
                .signed_duration_since(entered_at.with_timezone(&Utc))
                .to_std()
                .unwrap_or(Duration::ZERO);
            stage.delay().saturating_sub(elapsed)
        }
        // No stamp (message produced by something other than the retry
        // controller) — fall back to the full stage delay from arrival.
        None => stage.delay(),
    }
}

async fn run_stage(broker: Arc<dyn Broker>, config: Arc<Config>, stage: RetryStageConfig, cancel: CancellationToken) {
    let mut sub = match broker.subscribe(&stage.topic, &config.consumer_group_requeuer).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(topic = %stage.topic, error = %e, "requeuer failed to subscribe");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(topic = %stage.topic, "requeuer shutting down");
                return;
            }
            delivery = sub.recv() => {
                let Some(delivery) = delivery else { return };
                let delay = remaining_delay(&delivery.message, &stage);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        // Leave the offset uncommitted; it is redelivered
                        // and re-timed on the next run.
                        return;
                    }
                }

                if let Err(e) = broker.publish(&config.commands_topic, delivery.message.clone()).await {
                    error!(topic = %stage.topic, error = %e, "requeuer failed to republish");
                    continue;
                }
                if let Err(e) = sub.commit(&delivery).await {
                    error!(topic = %stage.topic, error = %e, "requeuer failed to commit offset");
                }
            }
        }
    }
}
