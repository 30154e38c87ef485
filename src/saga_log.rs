//! Append-only audit of step attempts, outcomes, and compensations.

use chrono::Utc;
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, Sqlite, Transaction};

use crate::error::ProcessingError;
use crate::storage::schema::SagaLog;

/// Terminal status of one saga step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    Pending,
    Success,
    Failure,
}

impl SagaStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::Success => "SUCCESS",
            SagaStatus::Failure => "FAILURE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SagaLogEntry {
    pub trace_id: String,
    pub step: String,
    pub status: String,
    pub error_code: Option<String>,
    pub detail: Option<String>,
}

pub struct SagaLogStore;

impl SagaLogStore {
    /// Append one audit row inside the same transaction as the effect it
    /// documents.
    pub async fn append(
        tx: &mut Transaction<'_, Sqlite>,
        trace_id: &str,
        step: &str,
        status: SagaStatus,
        error_code: Option<&str>,
        detail: Option<&str>,
    ) -> Result<(), ProcessingError> {
        let now = Utc::now().to_rfc3339();
        let query = Query::insert()
            .into_table(SagaLog::Table)
            .columns([
                SagaLog::TraceId,
                SagaLog::Step,
                SagaLog::Status,
                SagaLog::ErrorCode,
                SagaLog::Detail,
                SagaLog::CreatedAt,
            ])
            .values_panic([
                trace_id.into(),
                step.into(),
                status.as_str().into(),
                error_code.into(),
                detail.into(),
                now.into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&mut **tx)
            .await
            .map_err(|e| ProcessingError::Transient(e.to_string()))?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn entries_for(
        tx: &mut Transaction<'_, Sqlite>,
        trace_id: &str,
    ) -> Vec<SagaLogEntry> {
        let query = Query::select()
            .columns([
                SagaLog::TraceId,
                SagaLog::Step,
                SagaLog::Status,
                SagaLog::ErrorCode,
                SagaLog::Detail,
            ])
            .from(SagaLog::Table)
            .and_where(Expr::col(SagaLog::TraceId).eq(trace_id))
            .order_by(SagaLog::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut **tx).await.unwrap();
        rows.iter()
            .map(|r| SagaLogEntry {
                trace_id: r.get("trace_id"),
                step: r.get("step"),
                status: r.get("status"),
                error_code: r.get("error_code"),
                detail: r.get("detail"),
            })
            .collect()
    }
}
