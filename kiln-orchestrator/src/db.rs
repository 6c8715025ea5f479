use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    // WAL gives readers a consistent snapshot while a controller is writing
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // Create configurations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS configurations (
            id BLOB PRIMARY KEY,
            name TEXT NOT NULL,
            group_name TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            cron TEXT,
            webhook_token TEXT UNIQUE,
            last_run_number INTEGER NOT NULL DEFAULT 0,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before the run number counter existed
    let (has_counter,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM pragma_table_info('configurations') WHERE name = 'last_run_number'",
    )
    .fetch_one(pool)
    .await?;
    if has_counter == 0 {
        sqlx::query(
            "ALTER TABLE configurations ADD COLUMN last_run_number INTEGER NOT NULL DEFAULT 0",
        )
        .execute(pool)
        .await?;
    }

    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id BLOB PRIMARY KEY,
            configuration_id BLOB NOT NULL,
            number INTEGER NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            trigger_source TEXT NOT NULL,
            trigger_identity TEXT NOT NULL,
            requested_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            exit_code INTEGER,
            snapshot TEXT NOT NULL,
            artifact TEXT,
            release TEXT,
            failure TEXT,
            UNIQUE (configuration_id, number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create trigger audit table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trigger_events (
            id BLOB PRIMARY KEY,
            configuration_id BLOB NOT NULL,
            source TEXT NOT NULL,
            identity TEXT NOT NULL,
            outcome TEXT NOT NULL,
            run_id BLOB,
            detail TEXT,
            at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_runs_configuration ON runs(configuration_id, requested_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_requested_at ON runs(requested_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_configurations_group ON configurations(group_name)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_trigger_events_configuration ON trigger_events(configuration_id, at DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}

/// Milliseconds since the Unix epoch, the storage format of every timestamp
pub fn to_millis(at: chrono::DateTime<chrono::Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(any(test, feature = "testing"))]
pub(crate) mod testing {
    use super::*;

    /// Opens a migrated database inside `dir`
    pub async fn pool_in(dir: &std::path::Path) -> SqlitePool {
        let url = format!("sqlite://{}", dir.join("kiln-test.db").display());
        let pool = create_pool(&url).await.expect("create pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }
}
