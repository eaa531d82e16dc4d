//! Local persistent store backed by SQLite.
//!
//! One logical table per entity kind, keyed by record id, plus a fetch log
//! used by the freshness policy.

mod local;

pub use local::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        INSERT OR IGNORE INTO meta (id, schema_version, created_at)
        VALUES (1, 1, datetime('now'));
        "#,
    )
    .execute(pool)
    .await?;

    // `dirty` is set whenever the row or anything nested in it still has to
    // reach the server; refetches never overwrite dirty rows.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            store TEXT NOT NULL,
            id TEXT NOT NULL,
            owner TEXT,
            sync_state TEXT NOT NULL,
            payload TEXT NOT NULL,
            diff TEXT,
            dirty INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (store, id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fetch_log (
            cache_key TEXT PRIMARY KEY,
            fetched_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_records_owner ON records(store, owner);
        CREATE INDEX IF NOT EXISTS idx_records_dirty ON records(store, dirty);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
