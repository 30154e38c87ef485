//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building, mirroring the persistent schema named in the specification.

use sea_query::Iden;

/// `messages` table schema.
#[derive(Iden)]
pub enum Messages {
    Table,
    Id,
    Content,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// `saga_log` table schema.
#[derive(Iden)]
pub enum SagaLog {
    Table,
    Id,
    #[iden = "trace_id"]
    TraceId,
    Step,
    Status,
    #[iden = "error_code"]
    ErrorCode,
    Detail,
    #[iden = "created_at"]
    CreatedAt,
}

/// `idempotency_keys` table schema.
#[derive(Iden)]
pub enum IdempotencyKeys {
    Table,
    #[iden = "idempotency_key"]
    IdempotencyKey,
    #[iden = "last_status"]
    LastStatus,
    #[iden = "trace_id"]
    TraceId,
    #[iden = "processed_at"]
    ProcessedAt,
    /// Supplement beyond the distilled schema — see SPEC_FULL.md §3. Stores
    /// the serialized Ack so a redelivery can echo the exact prior payload.
    #[iden = "result_payload"]
    ResultPayload,
}

/// SQL for creating the `messages` table.
pub const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQL for creating the `saga_log` table.
pub const CREATE_SAGA_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS saga_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id TEXT NOT NULL,
    step TEXT NOT NULL,
    status TEXT NOT NULL,
    error_code TEXT,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_saga_log_trace_id ON saga_log(trace_id);
"#;

/// SQL for creating the `idempotency_keys` table.
pub const CREATE_IDEMPOTENCY_KEYS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    idempotency_key TEXT PRIMARY KEY,
    last_status TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    processed_at TEXT NOT NULL,
    result_payload TEXT NOT NULL
);
"#;
