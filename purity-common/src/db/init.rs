//! Database initialization
//!
//! Creates the SQLite file on first run, applies connection pragmas and
//! creates the tables the filter service depends on.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Busy timeout applied to every pooled connection. Lock waits beyond this
/// surface as "database is locked" and are handled by `retry_on_lock`.
const BUSY_TIMEOUT_MS: u32 = 250;

/// Open (or create) the database at `db_path` and ensure the schema exists
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    // WAL lets lookups proceed while a batch insert holds the write lock
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    let pragma_sql = format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT_MS);
    sqlx::query(&pragma_sql).execute(&pool).await?;

    create_schema(&pool).await?;

    info!("Database busy timeout set to {} ms", BUSY_TIMEOUT_MS);

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_image_annotations_table(pool).await?;
    create_licenses_table(pool).await?;
    Ok(())
}

/// Classification cache
///
/// No uniqueness on `uri`: concurrent misses for the same reference may
/// both insert, and lookups take the lowest rowid.
pub async fn create_image_annotations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_annotations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash TEXT NOT NULL,
            uri TEXT NOT NULL,
            error TEXT,
            date_added TEXT NOT NULL,
            adult INTEGER NOT NULL DEFAULT 0,
            spoof INTEGER NOT NULL DEFAULT 0,
            medical INTEGER NOT NULL DEFAULT 0,
            violence INTEGER NOT NULL DEFAULT 0,
            racy INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_image_annotations_uri ON image_annotations(uri)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_image_annotations_hash ON image_annotations(hash)")
        .execute(pool)
        .await?;

    Ok(())
}

/// License ledger
pub async fn create_licenses_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS licenses (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL DEFAULT '',
            stripe_id TEXT NOT NULL DEFAULT '',
            subscription_id TEXT NOT NULL DEFAULT '',
            is_valid INTEGER NOT NULL DEFAULT 1,
            validity_reason TEXT NOT NULL DEFAULT '',
            request_count INTEGER NOT NULL DEFAULT 0 CHECK (request_count >= 0),
            is_trial INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_licenses_stripe_id ON licenses(stripe_id)")
        .execute(pool)
        .await?;

    Ok(())
}
