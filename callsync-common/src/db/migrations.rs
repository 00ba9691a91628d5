//! Database schema migrations
//!
//! Versioned, idempotent migrations tracked in `schema_version`. Tables are
//! created by `init`; migrations add indexes and columns introduced later so
//! databases created by older builds upgrade in place.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - they must stay stable for upgrades
//! 2. **Always add new migrations** - one function per schema change
//! 3. **Prefer ALTER TABLE** - preserve data
//! 4. **Check before altering** - each migration must be safe to re-run

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database
///
/// Returns 0 if schema_version has no rows
async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("✓ Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }

    Ok(())
}

/// Migration v1: worker scan and read-path indexes
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    let statements = [
        "CREATE INDEX IF NOT EXISTS idx_inbox_call_status ON inbox_events(call_sid, status)",
        "CREATE INDEX IF NOT EXISTS idx_inbox_status_received ON inbox_events(status, received_at_ms)",
        "CREATE INDEX IF NOT EXISTS idx_calls_parent ON call_records(parent_call_sid)",
        "CREATE INDEX IF NOT EXISTS idx_calls_final_sync ON call_records(is_final, sync_state)",
        "CREATE INDEX IF NOT EXISTS idx_recordings_call ON recordings(call_sid)",
        "CREATE INDEX IF NOT EXISTS idx_transcripts_call ON transcripts(call_sid)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

/// Migration v2: timeline link on call records
///
/// Collaborators attach a call to a contact timeline; the core only stores
/// the identifier.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    let has_column: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('call_records') WHERE name = 'timeline_id'",
    )
    .fetch_one(pool)
    .await?;

    if has_column == 0 {
        sqlx::query("ALTER TABLE call_records ADD COLUMN timeline_id TEXT")
            .execute(pool)
            .await?;
        info!("Migration v2: Added timeline_id to call_records");
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_timeline ON call_records(timeline_id)")
        .execute(pool)
        .await?;

    Ok(())
}
