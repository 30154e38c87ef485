//! Envelope codec: serializes/deserializes command and ack envelopes and
//! stamps/extracts the header set every topic in the system relies on for
//! routing (`trace_id`, `idempotency_key`, `operation`, `resource`,
//! `attempt`, `original_topic`, `error`).
//!
//! The codec is pure and stateless: it never touches a broker or a
//! database. Partition keys are assigned by callers (the gateway for fresh
//! commands, the retry controller for re-published hops) since the key
//! discipline is a routing concern, not a serialization one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The four supported CRUD operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Read => "READ",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Operation::Create),
            "READ" => Ok(Operation::Read),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(EnvelopeError::Malformed(format!(
                "unknown operation {other}"
            ))),
        }
    }
}

/// A command envelope: instructs a mutation or read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub trace_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub resource: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub attempt: u32,
}

/// Terminal outcome of processing one command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Success,
    Failure,
}

/// Structured error detail carried on a FAILURE ack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub detail: String,
}

/// An ack envelope: the terminal result for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub trace_id: String,
    pub idempotency_key: String,
    pub status: AckStatus,
    pub event: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
}

impl Ack {
    pub fn success(trace_id: impl Into<String>, idempotency_key: impl Into<String>, event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            trace_id: trace_id.into(),
            idempotency_key: idempotency_key.into(),
            status: AckStatus::Success,
            event: Some(event.into()),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(trace_id: impl Into<String>, idempotency_key: impl Into<String>, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            idempotency_key: idempotency_key.into(),
            status: AckStatus::Failure,
            event: None,
            payload: None,
            error: Some(ErrorInfo {
                code: code.into(),
                detail: detail.into(),
            }),
        }
    }
}

/// Header set carried on every broker message, independent of the body's
/// serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers {
    pub trace_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub operation: Option<String>,
    pub resource: Option<String>,
    pub attempt: u32,
    pub original_topic: Option<String>,
    pub error: Option<String>,
    /// Free-form extension slots; unused by the runtime today but keeps the
    /// header map extensible the way a real broker's headers map is.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// Errors raised while decoding an envelope.
#[derive(Debug, Error, Clone)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// The wire-level unit every `Broker` implementation moves: a partition
/// key, a header map, and an opaque body.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Encode a command into a broker message keyed by `key`.
pub fn encode_command(cmd: &Command, key: impl Into<String>) -> BrokerMessage {
    let headers = Headers {
        trace_id: Some(cmd.trace_id.clone()),
        idempotency_key: Some(cmd.idempotency_key.clone()),
        operation: Some(cmd.operation.as_str().to_string()),
        resource: Some(cmd.resource.clone()),
        attempt: cmd.attempt,
        original_topic: None,
        error: None,
        extra: HashMap::new(),
    };
    BrokerMessage {
        key: key.into(),
        headers,
        body: serde_json::to_vec(cmd).expect("Command serializes infallibly"),
    }
}

/// Decode a command from a broker message. Fails with `Malformed` if the
/// required headers or body fields are missing.
pub fn decode_command(msg: &BrokerMessage) -> Result<Command, EnvelopeError> {
    if msg.headers.trace_id.as_deref().unwrap_or("").is_empty() {
        return Err(EnvelopeError::Malformed("missing trace_id header".into()));
    }
    if msg.headers.idempotency_key.as_deref().unwrap_or("").is_empty() {
        return Err(EnvelopeError::Malformed(
            "missing idempotency_key header".into(),
        ));
    }
    let cmd: Command = serde_json::from_slice(&msg.body)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid command body: {e}")))?;
    if cmd.resource.trim().is_empty() {
        return Err(EnvelopeError::Malformed("missing resource".into()));
    }
    Ok(cmd)
}

/// Encode an ack into a broker message keyed identically to its command.
pub fn encode_ack(ack: &Ack, key: impl Into<String>) -> BrokerMessage {
    let headers = Headers {
        trace_id: Some(ack.trace_id.clone()),
        idempotency_key: Some(ack.idempotency_key.clone()),
        operation: None,
        resource: None,
        attempt: 0,
        original_topic: None,
        error: ack.error.as_ref().map(|e| e.code.clone()),
        extra: HashMap::new(),
    };
    BrokerMessage {
        key: key.into(),
        headers,
        body: serde_json::to_vec(ack).expect("Ack serializes infallibly"),
    }
}

/// Decode an ack from a broker message.
pub fn decode_ack(msg: &BrokerMessage) -> Result<Ack, EnvelopeError> {
    if msg.headers.trace_id.as_deref().unwrap_or("").is_empty() {
        return Err(EnvelopeError::Malformed("missing trace_id header".into()));
    }
    serde_json::from_slice(&msg.body)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid ack body: {e}")))
}

/// Bump `attempt` on both the header and, for commands, the embedded body.
/// Used by the retry controller when hopping a message to the next stage.
pub fn bump_attempt(msg: &mut BrokerMessage) {
    msg.headers.attempt += 1;
    if let Ok(mut cmd) = serde_json::from_slice::<Command>(&msg.body) {
        cmd.attempt = msg.headers.attempt;
        msg.body = serde_json::to_vec(&cmd).expect("Command serializes infallibly");
    }
}

/// Stamp `original_topic` only if unset — the spec requires it is "never
/// overwritten after the first hop".
pub fn set_original_topic_if_unset(msg: &mut BrokerMessage, topic: &str) {
    if msg.headers.original_topic.is_none() {
        msg.headers.original_topic = Some(topic.to_string());
    }
}

/// Stamp the classified failure reason onto the `error` header.
pub fn set_error(msg: &mut BrokerMessage, reason: &str) {
    msg.headers.error = Some(reason.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_command() -> Command {
        Command {
            trace_id: "trace-1".into(),
            correlation_id: "corr-1".into(),
            timestamp: Utc::now(),
            operation: Operation::Create,
            resource: "messages".into(),
            payload: serde_json::json!({"content": "hello"}),
            idempotency_key: "idem-1".into(),
            attempt: 0,
        }
    }

    #[test]
    fn round_trips_a_command() {
        let cmd = sample_command();
        let msg = encode_command(&cmd, "idem-1");
        let decoded = decode_command(&msg).unwrap();
        assert_eq!(decoded.trace_id, cmd.trace_id);
        assert_eq!(decoded.idempotency_key, cmd.idempotency_key);
        assert_eq!(decoded.operation, Operation::Create);
    }

    #[test]
    fn rejects_missing_trace_id() {
        let mut msg = encode_command(&sample_command(), "idem-1");
        msg.headers.trace_id = None;
        assert!(matches!(
            decode_command(&msg),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_missing_idempotency_key() {
        let mut msg = encode_command(&sample_command(), "idem-1");
        msg.headers.idempotency_key = None;
        assert!(matches!(
            decode_command(&msg),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn bump_attempt_updates_header_and_body() {
        let mut msg = encode_command(&sample_command(), "idem-1");
        bump_attempt(&mut msg);
        assert_eq!(msg.headers.attempt, 1);
        let cmd = decode_command(&msg).unwrap();
        assert_eq!(cmd.attempt, 1);
    }

    #[test]
    fn original_topic_sticks_on_first_hop_only() {
        let mut msg = encode_command(&sample_command(), "idem-1");
        set_original_topic_if_unset(&mut msg, "commands");
        set_original_topic_if_unset(&mut msg, "retry.5s");
        assert_eq!(msg.headers.original_topic.as_deref(), Some("commands"));
    }

    #[test]
    fn ack_round_trips_and_preserves_key() {
        let ack = Ack::success("trace-1", "idem-1", "MessageCreated", serde_json::json!({"id": 1}));
        let msg = encode_ack(&ack, "idem-1");
        assert_eq!(msg.key, "idem-1");
        let decoded = decode_ack(&msg).unwrap();
        assert_eq!(decoded.status, AckStatus::Success);
        assert_eq!(decoded.event.as_deref(), Some("MessageCreated"));
    }
}
