//! Step processor: the single place a command turns into a domain effect.
//!
//! One delivery, one transaction: decode, check idempotency, dispatch to the
//! domain repository, append the saga log entry, mark idempotency, commit,
//! produce the ack, then — only then — commit the consumer offset. A
//! transient failure at commit time is retried in place a bounded number of
//! times before the message is handed to the retry controller.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{Broker, Subscription};
use crate::config::Config;
use crate::domain::{Message, MessageRepository};
use crate::envelope::{decode_command, encode_ack, Ack, Command, EnvelopeError, Operation};
use crate::error::ProcessingError;
use crate::idempotency::{IdempotencyOutcome, IdempotencyStore};
use crate::retry::RetryController;
use crate::saga_log::{SagaLogStore, SagaStatus};

/// Injection point for simulating storage faults in tests. Production
/// wiring uses `NoFaults`, which never intervenes.
pub trait FaultPolicy: Send + Sync {
    /// Classify a command before any effect is attempted. Used to simulate
    /// unrecoverable bugs surfacing for specific inputs.
    fn before_effect(&self, _cmd: &Command) -> Option<ProcessingError> {
        None
    }

    /// Classify a command at the point its transaction would otherwise
    /// commit. Used to simulate transient storage failures (connection
    /// drops, serialization conflicts) independent of the domain effect
    /// itself succeeding.
    fn at_commit(&self, _cmd: &Command, _attempt: u32) -> Option<ProcessingError> {
        None
    }
}

#[derive(Default)]
pub struct NoFaults;
impl FaultPolicy for NoFaults {}

fn step_name(op: Operation) -> &'static str {
    match op {
        Operation::Create => "create_message",
        Operation::Read => "read_message",
        Operation::Update => "update_message",
        Operation::Delete => "delete_message",
    }
}

fn payload_id(payload: &serde_json::Value) -> Result<i64, ProcessingError> {
    payload
        .get("id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ProcessingError::InvalidContent("missing or non-numeric id".into()))
}

fn payload_content(payload: &serde_json::Value) -> Result<String, ProcessingError> {
    payload
        .get("content")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProcessingError::InvalidContent("missing content".into()))
}

async fn dispatch(
    tx: &mut Transaction<'_, Sqlite>,
    cmd: &Command,
) -> Result<(String, serde_json::Value), ProcessingError> {
    match cmd.operation {
        Operation::Create => {
            let content = payload_content(&cmd.payload)?;
            let message = MessageRepository::create(tx, &content).await?;
            Ok(("MessageCreated".into(), message_json(&message)))
        }
        Operation::Read => {
            let id = payload_id(&cmd.payload)?;
            let message = MessageRepository::read(tx, id).await?;
            Ok(("MessageRead".into(), message_json(&message)))
        }
        Operation::Update => {
            let id = payload_id(&cmd.payload)?;
            let content = payload_content(&cmd.payload)?;
            let message = MessageRepository::update(tx, id, &content).await?;
            Ok(("MessageUpdated".into(), message_json(&message)))
        }
        Operation::Delete => {
            let id = payload_id(&cmd.payload)?;
            MessageRepository::delete(tx, id).await?;
            Ok(("MessageDeleted".into(), serde_json::json!({"id": id})))
        }
    }
}

fn message_json(message: &Message) -> serde_json::Value {
    serde_json::to_value(message).expect("Message serializes infallibly")
}

pub struct StepProcessor {
    pool: SqlitePool,
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
    retry: RetryController,
    faults: Arc<dyn FaultPolicy>,
}

impl StepProcessor {
    pub fn new(pool: SqlitePool, broker: Arc<dyn Broker>, config: Arc<Config>) -> Self {
        let retry = RetryController::new(broker.clone(), config.clone());
        Self {
            pool,
            broker,
            config,
            retry,
            faults: Arc::new(NoFaults),
        }
    }

    /// Override the fault policy — only ever used by tests that need to
    /// force a transient or fatal classification deterministically.
    pub fn with_fault_policy(mut self, faults: Arc<dyn FaultPolicy>) -> Self {
        self.faults = faults;
        self
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut sub = match self
            .broker
            .subscribe(&self.config.commands_topic, &self.config.consumer_group_processor)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                error!(error = %e, "processor failed to subscribe");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("step processor shutting down");
                    break;
                }
                delivery = sub.recv() => {
                    let Some(delivery) = delivery else {
                        warn!("commands topic closed");
                        break;
                    };
                    self.handle(delivery.message.clone()).await;
                    if let Err(e) = sub.commit(&delivery).await {
                        error!(error = %e, "failed to commit processor offset");
                    }
                }
            }
        }
    }

    async fn handle(&self, msg: crate::envelope::BrokerMessage) {
        let cmd = match decode_command(&msg) {
            Ok(cmd) => cmd,
            Err(EnvelopeError::Malformed(reason)) => {
                warn!(reason, "malformed command, routing to dlq");
                let err = ProcessingError::MalformedEnvelope(reason);
                if let Err(e) = self.retry.route_direct_to_dlq(msg, &err).await {
                    error!(error = %e, "failed to publish to dlq");
                }
                return;
            }
        };

        if let Some(err) = self.faults.before_effect(&cmd) {
            error!(trace_id = %cmd.trace_id, error = %err, "fault policy rejected command before effect");
            if let Err(e) = self.retry.route_direct_to_dlq(msg, &err).await {
                error!(error = %e, "failed to publish to dlq");
            }
            return;
        }

        match self.apply_with_retry(&cmd).await {
            Ok(ack) => {
                if let Err(e) = self.produce_ack(&cmd, ack).await {
                    error!(trace_id = %cmd.trace_id, error = %e, "failed to produce ack");
                }
            }
            Err(err) if err.is_dlq_direct() => {
                error!(trace_id = %cmd.trace_id, error = %err, "fatal error applying command, routing to dlq");
                if let Err(e) = self.retry.route_direct_to_dlq(msg, &err).await {
                    error!(error = %e, "failed to publish to dlq");
                }
            }
            Err(err) => {
                debug_assert!(err.is_retryable(), "unexpected non-retryable, non-dlq-direct error: {err}");
                info!(trace_id = %cmd.trace_id, error = %err, "routing command to retry stage after exhausting inline retries");
                if let Err(e) = self.retry.route_transient(msg, &err).await {
                    error!(error = %e, "failed to publish to retry stage");
                }
            }
        }
    }

    /// Apply a fresh (or duplicate) command, retrying the whole
    /// dispatch-and-commit cycle a bounded number of times when the commit
    /// step is classified transient.
    async fn apply_with_retry(&self, cmd: &Command) -> Result<Ack, ProcessingError> {
        let faults = self.faults.clone();
        let pool = self.pool.clone();
        let cmd = cmd.clone();

        let attempt_once = move || {
            let faults = faults.clone();
            let pool = pool.clone();
            let cmd = cmd.clone();
            async move {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| ProcessingError::Transient(e.to_string()))?;

                match IdempotencyStore::check(&mut tx, &cmd.idempotency_key).await? {
                    IdempotencyOutcome::AlreadyProcessed(ack) => Ok(ack),
                    IdempotencyOutcome::Fresh => {
                        let outcome = dispatch(&mut tx, &cmd).await;
                        let ack = match outcome {
                            Ok((event, payload)) => {
                                SagaLogStore::append(&mut tx, &cmd.trace_id, step_name(cmd.operation), SagaStatus::Success, None, None).await?;
                                Ack::success(&cmd.trace_id, &cmd.idempotency_key, event, payload)
                            }
                            Err(err @ (ProcessingError::NotFound(_) | ProcessingError::InvalidContent(_))) => {
                                SagaLogStore::append(&mut tx, &cmd.trace_id, step_name(cmd.operation), SagaStatus::Failure, Some(err.code()), Some(&err.detail())).await?;
                                Ack::failure(&cmd.trace_id, &cmd.idempotency_key, err.code(), err.detail())
                            }
                            Err(err) => return Err(err),
                        };
                        IdempotencyStore::mark(&mut tx, &cmd.idempotency_key, &cmd.trace_id, &ack).await?;

                        if let Some(err) = faults.at_commit(&cmd, cmd.attempt) {
                            return Err(err);
                        }

                        tx.commit()
                            .await
                            .map_err(|e| ProcessingError::Transient(e.to_string()))?;
                        Ok(ack)
                    }
                }
            }
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(20))
            .with_max_delay(Duration::from_millis(500))
            .with_max_times(self.config.max_transient_inline_retries as usize);

        attempt_once
            .retry(backoff)
            .when(|e: &ProcessingError| matches!(e, ProcessingError::Transient(_)))
            .notify(|err, dur| {
                warn!(error = %err, delay = ?dur, "retrying transient storage failure inline");
            })
            .await
    }

    async fn produce_ack(&self, cmd: &Command, ack: Ack) -> crate::bus::Result<()> {
        let key = partition_key(cmd);
        let msg = encode_ack(&ack, key);
        self.broker.publish(&self.config.acks_topic, msg).await
    }
}

/// The partition key used to publish a command: the idempotency key for
/// `Create` (no resource id exists yet), the resource id for everything
/// else, so that ordering is preserved per logical resource.
pub fn partition_key(cmd: &Command) -> String {
    match cmd.operation {
        Operation::Create => cmd.idempotency_key.clone(),
        _ => cmd
            .payload
            .get("id")
            .map(|v| v.to_string())
            .unwrap_or_else(|| cmd.idempotency_key.clone()),
    }
}
