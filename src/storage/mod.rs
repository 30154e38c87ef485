//! Storage initialization: connection pool + schema bootstrap.

pub mod schema;

use sqlx::sqlite::{SqlitePoolOptions, SqliteConnectOptions};
use sqlx::SqlitePool;
use tracing::info;

use self::schema::{CREATE_IDEMPOTENCY_KEYS_TABLE, CREATE_MESSAGES_TABLE, CREATE_SAGA_LOG_TABLE};

/// Open (creating if necessary) a SQLite pool and run the schema migration.
pub async fn init_pool(dsn: &str) -> Result<SqlitePool, sqlx::Error> {
    let options: SqliteConnectOptions = dsn.parse::<SqliteConnectOptions>()?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    sqlx::query(CREATE_MESSAGES_TABLE).execute(&pool).await?;
    sqlx::query(CREATE_SAGA_LOG_TABLE).execute(&pool).await?;
    sqlx::query(CREATE_IDEMPOTENCY_KEYS_TABLE)
        .execute(&pool)
        .await?;

    info!(dsn, "storage initialized");
    Ok(pool)
}
