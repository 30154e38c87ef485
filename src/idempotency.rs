//! Idempotency store: the per-transaction dedup check that lets the step
//! processor treat at-least-once delivery as if it were exactly-once for
//! the effects it guards.

use chrono::Utc;
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sqlx::{Row, Sqlite, Transaction};

use crate::envelope::{Ack, AckStatus};
use crate::error::ProcessingError;
use crate::storage::schema::IdempotencyKeys;

/// Outcome of checking an idempotency key.
pub enum IdempotencyOutcome {
    /// Never seen before; the caller should apply the effect and then
    /// record the result with `mark`.
    Fresh,
    /// Already applied; `ack` is the ack produced the first time, safe to
    /// re-emit verbatim without touching the domain store again.
    AlreadyProcessed(Ack),
}

pub struct IdempotencyStore;

impl IdempotencyStore {
    /// `CheckAndMark` read half: look up whether `key` was already
    /// processed. Does not insert — callers that get `Fresh` must call
    /// `mark` inside the same transaction once the effect has been applied.
    pub async fn check(
        tx: &mut Transaction<'_, Sqlite>,
        idempotency_key: &str,
    ) -> Result<IdempotencyOutcome, ProcessingError> {
        let query = Query::select()
            .column(IdempotencyKeys::ResultPayload)
            .from(IdempotencyKeys::Table)
            .and_where(Expr::col(IdempotencyKeys::IdempotencyKey).eq(idempotency_key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| ProcessingError::Transient(e.to_string()))?;

        Ok(match row {
            Some(row) => {
                let payload: String = row.get("result_payload");
                let ack: Ack =
                    serde_json::from_str(&payload).expect("stored ack deserializes");
                IdempotencyOutcome::AlreadyProcessed(ack)
            }
            None => IdempotencyOutcome::Fresh,
        })
    }

    /// Record the outcome of a fresh application. Must run inside the same
    /// transaction as the domain effect it guards, so a rollback reverts
    /// both together.
    pub async fn mark(
        tx: &mut Transaction<'_, Sqlite>,
        idempotency_key: &str,
        trace_id: &str,
        ack: &Ack,
    ) -> Result<(), ProcessingError> {
        let last_status = match ack.status {
            AckStatus::Success => "SUCCESS",
            AckStatus::Failure => "FAILURE",
        };
        let processed_at = Utc::now().to_rfc3339();
        let result_payload = serde_json::to_string(ack).expect("ack serializes");

        let query = Query::insert()
            .into_table(IdempotencyKeys::Table)
            .columns([
                IdempotencyKeys::IdempotencyKey,
                IdempotencyKeys::LastStatus,
                IdempotencyKeys::TraceId,
                IdempotencyKeys::ProcessedAt,
                IdempotencyKeys::ResultPayload,
            ])
            .values_panic([
                idempotency_key.into(),
                last_status.into(),
                trace_id.into(),
                processed_at.into(),
                result_payload.into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&mut **tx)
            .await
            .map_err(|e| ProcessingError::Transient(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_pool;

    #[tokio::test]
    async fn fresh_key_then_marked_becomes_already_processed() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        let mut tx = pool.begin().await.unwrap();

        assert!(matches!(
            IdempotencyStore::check(&mut tx, "idem-1").await.unwrap(),
            IdempotencyOutcome::Fresh
        ));

        let ack = Ack::success("trace-1", "idem-1", "MessageCreated", serde_json::json!({"id": 1}));
        IdempotencyStore::mark(&mut tx, "idem-1", "trace-1", &ack).await.unwrap();

        match IdempotencyStore::check(&mut tx, "idem-1").await.unwrap() {
            IdempotencyOutcome::AlreadyProcessed(cached) => {
                assert_eq!(cached.trace_id, "trace-1");
                assert_eq!(cached.event.as_deref(), Some("MessageCreated"));
            }
            IdempotencyOutcome::Fresh => panic!("expected AlreadyProcessed"),
        }
    }
}
