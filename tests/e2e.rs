//! End-to-end scenarios exercising the full pipeline: gateway envelope
//! construction (built by hand here, bypassing HTTP), step processor, retry
//! controller/re-queuer, and dlq replayer, wired over the in-memory broker
//! and an in-memory SQLite store.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use saga_runtime::bus::{self, Broker, Delivery, InMemoryBroker, Subscription};
use saga_runtime::config::{Config, RetryStageConfig};
use saga_runtime::dlq::DlqReplayer;
use saga_runtime::domain::MessageRepository;
use saga_runtime::envelope::{decode_ack, encode_command, Ack, AckStatus, BrokerMessage, Command, Operation};
use saga_runtime::error::ProcessingError;
use saga_runtime::processor::{FaultPolicy, StepProcessor};
use saga_runtime::retry::Requeuer;
use saga_runtime::storage;

fn fast_test_config() -> Config {
    let mut config = Config::for_test();
    config.retry_stages = vec![
        RetryStageConfig { topic: "retry.5s".into(), delay_secs: 0 },
        RetryStageConfig { topic: "retry.30s".into(), delay_secs: 0 },
        RetryStageConfig { topic: "retry.2m".into(), delay_secs: 0 },
    ];
    config.max_transient_inline_retries = 0;
    config
}

fn command(operation: Operation, payload: serde_json::Value) -> Command {
    let trace_id = Uuid::new_v4().to_string();
    Command {
        trace_id: trace_id.clone(),
        correlation_id: trace_id,
        timestamp: chrono::Utc::now(),
        operation,
        resource: "messages".into(),
        payload,
        idempotency_key: Uuid::new_v4().to_string(),
        attempt: 0,
    }
}

async fn recv_ack(broker: &Arc<InMemoryBroker>, topic: &str) -> Option<Ack> {
    let mut sub = broker.subscribe(topic, "test").await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.ok()??;
    decode_ack(&delivery.message).ok()
}

async fn expect_silence(broker: &Arc<InMemoryBroker>, topic: &str) {
    let mut sub = broker.subscribe(topic, "test").await.unwrap();
    let result = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(result.is_err(), "expected no message on {topic}");
}

/// Records every topic a message was published to, in order — used to
/// assert a message traversed the expected retry stages.
struct RecordingBroker {
    inner: InMemoryBroker,
    published: Mutex<Vec<String>>,
}

impl RecordingBroker {
    fn new() -> Self {
        Self { inner: InMemoryBroker::new(), published: Mutex::new(Vec::new()) }
    }

    fn topics_seen(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn publish(&self, topic: &str, message: BrokerMessage) -> bus::Result<()> {
        self.published.lock().unwrap().push(topic.to_string());
        self.inner.publish(topic, message).await
    }

    async fn subscribe(&self, topic: &str, group: &str) -> bus::Result<Box<dyn Subscription>> {
        self.inner.subscribe(topic, group).await
    }
}

#[tokio::test]
async fn happy_create() {
    let config = Arc::new(fast_test_config());
    let pool = storage::init_pool("sqlite::memory:").await.unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let processor = StepProcessor::new(pool.clone(), broker.clone() as Arc<dyn Broker>, config.clone());
    let cancel = CancellationToken::new();
    let _task = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    let cmd = command(Operation::Create, serde_json::json!({"content": "hello"}));
    let msg = encode_command(&cmd, cmd.idempotency_key.clone());
    broker.publish(&config.commands_topic, msg).await.unwrap();

    let ack = recv_ack(&broker, &config.acks_topic).await.expect("ack");
    assert_eq!(ack.status, AckStatus::Success);
    assert_eq!(ack.event.as_deref(), Some("MessageCreated"));
    assert_eq!(ack.payload.unwrap()["content"], "hello");

    let mut tx = pool.begin().await.unwrap();
    let row = MessageRepository::read(&mut tx, 1).await.unwrap();
    assert_eq!(row.content, "hello");

    cancel.cancel();
}

#[tokio::test]
async fn update_not_found_yields_failure_ack_no_retry_no_dlq() {
    let config = Arc::new(fast_test_config());
    let pool = storage::init_pool("sqlite::memory:").await.unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let processor = StepProcessor::new(pool.clone(), broker.clone() as Arc<dyn Broker>, config.clone());
    let cancel = CancellationToken::new();
    let _task = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    let cmd = command(Operation::Update, serde_json::json!({"id": 999, "content": "x"}));
    let msg = encode_command(&cmd, "999");
    broker.publish(&config.commands_topic, msg).await.unwrap();

    let ack = recv_ack(&broker, &config.acks_topic).await.expect("ack");
    assert_eq!(ack.status, AckStatus::Failure);
    let error = ack.error.unwrap();
    assert_eq!(error.code, "NOT_FOUND");
    assert_eq!(error.detail, "id=999");

    expect_silence(&broker, &config.dlq_topic).await;
    cancel.cancel();
}

/// Fails the first `n` attempts at commit time with a transient error, then
/// lets every later attempt through.
struct CountedTransientFailures {
    remaining: AtomicU32,
}

impl CountedTransientFailures {
    fn new(n: u32) -> Self {
        Self { remaining: AtomicU32::new(n) }
    }
}

impl FaultPolicy for CountedTransientFailures {
    fn at_commit(&self, _cmd: &Command, _attempt: u32) -> Option<ProcessingError> {
        let mut current = self.remaining.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return None;
            }
            match self.remaining.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Some(ProcessingError::Transient("simulated connection drop".into())),
                Err(observed) => current = observed,
            }
        }
    }
}

#[tokio::test]
async fn transient_storm_recovers_through_retry_stages() {
    let config = Arc::new(fast_test_config());
    let pool = storage::init_pool("sqlite::memory:").await.unwrap();
    let broker = Arc::new(RecordingBroker::new());
    let broker_dyn: Arc<dyn Broker> = broker.clone();

    let processor = StepProcessor::new(pool.clone(), broker_dyn.clone(), config.clone())
        .with_fault_policy(Arc::new(CountedTransientFailures::new(2)));
    let requeuer = Requeuer::new(broker_dyn.clone(), config.clone());
    let cancel = CancellationToken::new();
    let _processor_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });
    let _requeuer_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { requeuer.run(cancel).await }
    });

    let cmd = command(Operation::Create, serde_json::json!({"content": "ok"}));
    let msg = encode_command(&cmd, cmd.idempotency_key.clone());
    broker_dyn.publish(&config.commands_topic, msg).await.unwrap();

    let mut sub = broker_dyn.subscribe(&config.acks_topic, "test").await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    let ack = decode_ack(&delivery.message).unwrap();
    assert_eq!(ack.status, AckStatus::Success);

    let topics = broker.topics_seen();
    assert!(topics.contains(&"retry.5s".to_string()));
    assert!(topics.contains(&"retry.30s".to_string()));

    let mut tx = pool.begin().await.unwrap();
    let rows = MessageRepository::list(&mut tx).await;
    assert_eq!(rows.len(), 1);

    cancel.cancel();
}

/// Gate that treats `"poison"` content as fatal until flipped.
struct PoisonGate {
    accepted: AtomicBool,
}

impl PoisonGate {
    fn new() -> Self {
        Self { accepted: AtomicBool::new(false) }
    }

    fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }
}

impl FaultPolicy for PoisonGate {
    fn before_effect(&self, cmd: &Command) -> Option<ProcessingError> {
        let is_poison = cmd.payload.get("content").and_then(|v| v.as_str()) == Some("poison");
        if is_poison && !self.accepted.load(Ordering::SeqCst) {
            Some(ProcessingError::Fatal("poison content rejected".into()))
        } else {
            None
        }
    }
}

#[tokio::test]
async fn fatal_command_goes_to_dlq_then_replays_after_fix() {
    let config = Arc::new(fast_test_config());
    let pool = storage::init_pool("sqlite::memory:").await.unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let broker_dyn: Arc<dyn Broker> = broker.clone();
    let gate = Arc::new(PoisonGate::new());

    let processor = StepProcessor::new(pool.clone(), broker_dyn.clone(), config.clone())
        .with_fault_policy(gate.clone());
    let cancel = CancellationToken::new();
    let _processor_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    let cmd = command(Operation::Create, serde_json::json!({"content": "poison"}));
    let msg = encode_command(&cmd, cmd.idempotency_key.clone());
    broker_dyn.publish(&config.commands_topic, msg).await.unwrap();

    let mut dlq_sub = broker_dyn.subscribe(&config.dlq_topic, "test").await.unwrap();
    let dead_letter = tokio::time::timeout(Duration::from_secs(2), dlq_sub.recv()).await.unwrap().unwrap();
    assert_eq!(dead_letter.message.headers.original_topic.as_deref(), Some(config.commands_topic.as_str()));
    drop(dlq_sub);

    expect_silence(&broker, &config.acks_topic).await;

    gate.accept();
    let replayer = DlqReplayer::new(broker_dyn.clone(), config.clone());
    let _replayer_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { replayer.run(cancel).await }
    });

    let ack = recv_ack(&broker, &config.acks_topic).await.expect("ack after replay");
    assert_eq!(ack.status, AckStatus::Success);

    let mut tx = pool.begin().await.unwrap();
    let rows = MessageRepository::list(&mut tx).await;
    assert_eq!(rows.len(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn per_key_updates_apply_in_submission_order() {
    let config = Arc::new(fast_test_config());
    let pool = storage::init_pool("sqlite::memory:").await.unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let broker_dyn: Arc<dyn Broker> = broker.clone();
    let processor = StepProcessor::new(pool.clone(), broker_dyn.clone(), config.clone());
    let cancel = CancellationToken::new();
    let _task = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    let create = command(Operation::Create, serde_json::json!({"content": "a"}));
    let msg = encode_command(&create, create.idempotency_key.clone());
    broker_dyn.publish(&config.commands_topic, msg).await.unwrap();
    let created = recv_ack(&broker, &config.acks_topic).await.unwrap();
    let id = created.payload.unwrap()["id"].as_i64().unwrap();

    let update_b = command(Operation::Update, serde_json::json!({"id": id, "content": "b"}));
    let update_c = command(Operation::Update, serde_json::json!({"id": id, "content": "c"}));
    broker_dyn.publish(&config.commands_topic, encode_command(&update_b, id.to_string())).await.unwrap();
    broker_dyn.publish(&config.commands_topic, encode_command(&update_c, id.to_string())).await.unwrap();

    let mut sub = broker_dyn.subscribe(&config.acks_topic, "order-check").await.unwrap();
    let _first = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
    let _second = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();

    let mut tx = pool.begin().await.unwrap();
    let row = MessageRepository::read(&mut tx, id).await.unwrap();
    assert_eq!(row.content, "c");

    cancel.cancel();
}

