//! Database initialization
//!
//! Creates the SQLite database on first run, sets per-connection options and
//! brings the schema up to date. Every statement is idempotent, so calling
//! `init_database` against an existing file is safe.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every pooled connection
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Options every connection opens with, including ones the pool adds later
fn connect_options(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .foreign_keys(true)
}

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // WAL allows concurrent readers with one writer; the inbox worker and the
    // reconciliation tiers write while read routes query.
    let options = connect_options(SqliteConnectOptions::new().filename(db_path))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    prepare_schema(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// Each SQLite in-memory connection is a separate database, so the pool is
/// capped at one connection that is never recycled.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = connect_options(SqliteConnectOptions::from_str("sqlite::memory:")?);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    prepare_schema(&pool).await?;

    Ok(pool)
}

async fn prepare_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_inbox_events_table(pool).await?;
    create_call_records_table(pool).await?;
    create_recordings_table(pool).await?;
    create_transcripts_table(pool).await?;

    crate::db::migrations::run_migrations(pool).await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable landing table for every inbound callback
///
/// The unique `event_key` is the idempotency contract.
async fn create_inbox_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inbox_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_key TEXT NOT NULL UNIQUE,
            source TEXT NOT NULL,
            event_type TEXT NOT NULL,
            call_sid TEXT,
            payload TEXT NOT NULL,
            headers TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processed', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            retryable INTEGER NOT NULL DEFAULT 1,
            error_text TEXT,
            received_at_ms INTEGER NOT NULL,
            processed_at_ms INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Canonical call table, one row per call leg
///
/// `parent_call_sid` is a weak self-reference: a child leg may be stored
/// before its parent arrives, so no foreign key is declared.
async fn create_call_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            call_sid TEXT NOT NULL UNIQUE,
            parent_call_sid TEXT,
            status TEXT NOT NULL,
            is_final INTEGER NOT NULL DEFAULT 0,
            finalized_at_ms INTEGER,
            sync_state TEXT NOT NULL DEFAULT 'active'
                CHECK (sync_state IN ('active', 'frozen')),
            direction TEXT NOT NULL DEFAULT 'external',
            from_number TEXT,
            to_number TEXT,
            duration_sec INTEGER NOT NULL DEFAULT 0,
            answered_at_ms INTEGER,
            started_at_ms INTEGER,
            ended_at_ms INTEGER,
            price REAL,
            price_unit TEXT,
            last_event_ms INTEGER NOT NULL,
            verified_at_ms INTEGER,
            version INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_recordings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recordings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recording_sid TEXT NOT NULL UNIQUE,
            call_sid TEXT NOT NULL REFERENCES call_records(call_sid),
            status TEXT NOT NULL,
            url TEXT,
            duration_sec INTEGER,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_transcripts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcripts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transcription_sid TEXT NOT NULL UNIQUE,
            call_sid TEXT NOT NULL REFERENCES call_records(call_sid),
            recording_sid TEXT,
            status TEXT NOT NULL,
            text TEXT,
            url TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
