//! Domain repository: transactional CRUD over the `Message` entity.
//!
//! The step processor exclusively owns DB mutations for `Message`; every
//! operation here takes a caller-supplied transaction so the effect, the
//! idempotency marker, and the saga log entry commit atomically together.

use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, Sqlite, Transaction};
use serde::Serialize;

use crate::error::DomainError;
use crate::storage::schema::Messages;

/// The business entity this runtime owns.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn validate_content(content: &str) -> Result<String, DomainError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(DomainError::InvalidContent);
    }
    Ok(trimmed.to_string())
}

fn validate_id(id: i64) -> Result<(), DomainError> {
    if id <= 0 {
        return Err(DomainError::InvalidContent);
    }
    Ok(())
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Message {
        id: row.get("id"),
        content: row.get("content"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .unwrap()
            .with_timezone(&Utc),
    }
}

/// Transactional CRUD over `Message`. Stateless — every method takes the
/// transaction it should run under.
pub struct MessageRepository;

impl MessageRepository {
    pub async fn create(
        tx: &mut Transaction<'_, Sqlite>,
        content: &str,
    ) -> Result<Message, DomainError> {
        let content = validate_content(content)?;
        let now = Utc::now().to_rfc3339();

        let query = Query::insert()
            .into_table(Messages::Table)
            .columns([Messages::Content, Messages::CreatedAt, Messages::UpdatedAt])
            .values_panic([content.clone().into(), now.clone().into(), now.into()])
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query)
            .execute(&mut **tx)
            .await
            .map_err(|e| DomainError::Storage(e.to_string()))?;
        let id = result.last_insert_rowid();

        Self::read(tx, id).await
    }

    pub async fn read(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<Message, DomainError> {
        validate_id(id)?;

        let query = Query::select()
            .columns([
                Messages::Id,
                Messages::Content,
                Messages::CreatedAt,
                Messages::UpdatedAt,
            ])
            .from(Messages::Table)
            .and_where(Expr::col(Messages::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| DomainError::Storage(e.to_string()))?;

        row.map(|r| row_to_message(&r)).ok_or(DomainError::NotFound(id))
    }

    pub async fn update(
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        content: &str,
    ) -> Result<Message, DomainError> {
        validate_id(id)?;
        let content = validate_content(content)?;

        // Confirm existence first so a miss surfaces as NotFound rather
        // than a silent zero-row update.
        Self::read(tx, id).await?;

        let now = Utc::now().to_rfc3339();
        let query = Query::update()
            .table(Messages::Table)
            .values([
                (Messages::Content, content.into()),
                (Messages::UpdatedAt, now.into()),
            ])
            .and_where(Expr::col(Messages::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&mut **tx)
            .await
            .map_err(|e| DomainError::Storage(e.to_string()))?;

        Self::read(tx, id).await
    }

    pub async fn delete(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<(), DomainError> {
        validate_id(id)?;

        // Confirm existence first so the caller gets NotFound rather than
        // a silently-ignored delete of a row that was never there.
        Self::read(tx, id).await?;

        let query = Query::delete()
            .from_table(Messages::Table)
            .and_where(Expr::col(Messages::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&mut **tx)
            .await
            .map_err(|e| DomainError::Storage(e.to_string()))?;

        Ok(())
    }

    /// List all messages ordered by id, newest last. Not part of the spec's
    /// CRUD surface; used only by tests to assert final state.
    pub async fn list(tx: &mut Transaction<'_, Sqlite>) -> Vec<Message> {
        let query = Query::select()
            .columns([
                Messages::Id,
                Messages::Content,
                Messages::CreatedAt,
                Messages::UpdatedAt,
            ])
            .from(Messages::Table)
            .order_by(Messages::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut **tx).await.unwrap();
        rows.iter().map(row_to_message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_pool;

    async fn pool() -> sqlx::SqlitePool {
        init_pool("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_then_read() {
        let pool = pool().await;
        let mut tx = pool.begin().await.unwrap();
        let created = MessageRepository::create(&mut tx, "hello").await.unwrap();
        assert_eq!(created.id, 1);
        assert_eq!(created.content, "hello");

        let fetched = MessageRepository::read(&mut tx, 1).await.unwrap();
        assert_eq!(fetched, created);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn create_trims_and_rejects_empty_content() {
        let pool = pool().await;
        let mut tx = pool.begin().await.unwrap();
        let created = MessageRepository::create(&mut tx, "  padded  ").await.unwrap();
        assert_eq!(created.content, "padded");

        let err = MessageRepository::create(&mut tx, "   ").await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidContent));
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let pool = pool().await;
        let mut tx = pool.begin().await.unwrap();
        let err = MessageRepository::read(&mut tx, 999).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(999)));
    }

    #[tokio::test]
    async fn update_missing_is_not_found_and_update_changes_content() {
        let pool = pool().await;
        let mut tx = pool.begin().await.unwrap();
        MessageRepository::create(&mut tx, "a").await.unwrap();

        let err = MessageRepository::update(&mut tx, 999, "x").await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(999)));

        let updated = MessageRepository::update(&mut tx, 1, "b").await.unwrap();
        assert_eq!(updated.content, "b");
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let pool = pool().await;
        let mut tx = pool.begin().await.unwrap();
        let err = MessageRepository::delete(&mut tx, 1).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(1)));
    }

    #[tokio::test]
    async fn id_le_zero_is_invalid_content() {
        let pool = pool().await;
        let mut tx = pool.begin().await.unwrap();
        let err = MessageRepository::read(&mut tx, 0).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidContent));
    }
}
