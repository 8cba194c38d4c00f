use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Records are keyed by (source_type, id); timestamps are unix millis.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_records (
            source_type TEXT NOT NULL,
            id TEXT NOT NULL,
            title TEXT,
            content TEXT NOT NULL,
            severity TEXT,
            component TEXT,
            status TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (source_type, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_vectors (
            source_type TEXT NOT NULL,
            id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (source_type, id),
            FOREIGN KEY (source_type, id) REFERENCES source_records(source_type, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_created_at ON source_records(created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_severity ON source_records(source_type, severity)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_component ON source_records(source_type, component)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
