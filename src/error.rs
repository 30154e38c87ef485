//! Error taxonomy shared by the processor, retry controller, and gateway.
//!
//! Every failure a component can produce is translated into one of these
//! categories before a routing decision is made. Retries never cross
//! category boundaries: a `NotFound` is never retried into a `Transient`.

use thiserror::Error;

/// A classified processing failure, carrying a stable short code for the
/// `error` header and operator-facing detail.
#[derive(Debug, Error, Clone)]
pub enum ProcessingError {
    /// Missing/invalid headers or body. Routed directly to DLQ, no retry.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Domain validation failure (empty content, id <= 0). FAILURE ack, no retry.
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// Read/Update/Delete on an absent id. FAILURE ack, no retry.
    #[error("not found: {0}")]
    NotFound(String),

    /// DB deadlock/timeout, broker connectivity, serializable-conflict
    /// exhaustion. Routed to the next retry stage; DLQ after the last stage.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Ack or retry publish failed after a successful DB commit. Retried
    /// in place with backoff; offset stays uncommitted.
    #[error("producer failure: {0}")]
    ProducerFailure(String),

    /// Unrecoverable internal bug. Surfaces as DLQ with diagnostic detail.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl ProcessingError {
    /// Stable short code carried in the `error` header.
    pub fn code(&self) -> &'static str {
        match self {
            ProcessingError::MalformedEnvelope(_) => "MALFORMED",
            ProcessingError::InvalidContent(_) => "INVALID_CONTENT",
            ProcessingError::NotFound(_) => "NOT_FOUND",
            ProcessingError::Transient(_) => "TRANSIENT_DB",
            ProcessingError::ProducerFailure(_) => "PRODUCER_FAILURE",
            ProcessingError::Fatal(_) => "FATAL",
        }
    }

    /// Free-form operator detail (the message text).
    pub fn detail(&self) -> String {
        match self {
            ProcessingError::MalformedEnvelope(d)
            | ProcessingError::InvalidContent(d)
            | ProcessingError::NotFound(d)
            | ProcessingError::Transient(d)
            | ProcessingError::ProducerFailure(d)
            | ProcessingError::Fatal(d) => d.clone(),
        }
    }

    /// Whether this category is ever eligible for a retry-stage hop.
    /// `Fatal`/`MalformedEnvelope` skip straight to DLQ; `NotFound` and
    /// `InvalidContent` are terminal FAILURE acks with no retry at all.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::Transient(_))
    }

    /// Whether this category routes directly to DLQ without consuming a
    /// retry stage.
    pub fn is_dlq_direct(&self) -> bool {
        matches!(
            self,
            ProcessingError::MalformedEnvelope(_) | ProcessingError::Fatal(_)
        )
    }
}

/// Domain-level validation/lookup errors raised by the repository.
#[derive(Debug, Error, Clone)]
pub enum DomainError {
    #[error("content must not be empty")]
    InvalidContent,
    #[error("message {0} not found")]
    NotFound(i64),
    /// A `sqlx` query failed (lock contention, timeout, connection loss).
    /// Always routed onward as `Transient` so it hits the retry ladder
    /// instead of surfacing as a domain-level rejection.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for ProcessingError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::InvalidContent => ProcessingError::InvalidContent(e.to_string()),
            DomainError::NotFound(id) => ProcessingError::NotFound(format!("id={id}")),
            DomainError::Storage(detail) => ProcessingError::Transient(detail),
        }
    }
}
