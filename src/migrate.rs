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

/// Create every table, index and guard trigger. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Discovery queue. `seq` breaks ties between equal enqueue timestamps.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discovery_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL DEFAULT '{}',
            source_id TEXT NOT NULL,
            source_kind TEXT NOT NULL DEFAULT 'other',
            priority INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 10),
            status TEXT NOT NULL DEFAULT 'pending',
            enqueued_at INTEGER NOT NULL,
            claimed_at INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Source registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_registry (
            url TEXT PRIMARY KEY,
            kind TEXT,
            scan_count INTEGER NOT NULL DEFAULT 1,
            items_yielded INTEGER NOT NULL DEFAULT 0,
            first_seen_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Research sessions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS research_sessions (
            research_id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'in_progress',
            completeness_score REAL,
            overall_confidence TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Research steps
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS research_steps (
            step_id INTEGER PRIMARY KEY AUTOINCREMENT,
            research_id TEXT NOT NULL,
            source_url TEXT NOT NULL,
            source_kind TEXT NOT NULL DEFAULT 'other',
            fields_json TEXT NOT NULL DEFAULT '[]',
            confidence TEXT NOT NULL,
            notes TEXT,
            logged_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Steps are append-only; completed sessions are frozen.
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS research_steps_no_update
        BEFORE UPDATE ON research_steps
        BEGIN
            SELECT RAISE(ABORT, 'research steps are append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS research_steps_no_delete
        BEFORE DELETE ON research_steps
        BEGIN
            SELECT RAISE(ABORT, 'research steps are append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS research_sessions_frozen
        BEFORE UPDATE ON research_sessions
        WHEN OLD.status = 'completed'
        BEGIN
            SELECT RAISE(ABORT, 'completed research sessions are immutable');
        END
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_serving ON discovery_queue(status, priority DESC, enqueued_at, seq)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_registry_last_seen ON source_registry(last_seen_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_registry_kind ON source_registry(kind)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_item ON research_sessions(item_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_steps_research ON research_steps(research_id)")
        .execute(pool)
        .await?;

    Ok(())
}
