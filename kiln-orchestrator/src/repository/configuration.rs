//! Configuration Repository
//!
//! Handles all database operations related to build configurations.
//! The full configuration is stored as JSON; the columns next to it only
//! exist so lookups by group, token and schedule stay indexed.

use kiln_core::domain::configuration::BuildConfiguration;
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::db::to_millis;

/// Insert a new configuration
pub async fn create(pool: &SqlitePool, config: &BuildConfiguration) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO configurations (
            id, name, group_name, enabled, cron, webhook_token, body, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(config.id)
    .bind(&config.name)
    .bind(&config.group)
    .bind(config.triggers.enabled)
    .bind(&config.triggers.cron)
    .bind(&config.triggers.webhook_token)
    .bind(Json(config))
    .bind(to_millis(config.created_at))
    .bind(to_millis(config.updated_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Replace a stored configuration
pub async fn update(pool: &SqlitePool, config: &BuildConfiguration) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE configurations
        SET name = ?, group_name = ?, enabled = ?, cron = ?, webhook_token = ?,
            body = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&config.name)
    .bind(&config.group)
    .bind(config.triggers.enabled)
    .bind(&config.triggers.cron)
    .bind(&config.triggers.webhook_token)
    .bind(Json(config))
    .bind(to_millis(config.updated_at))
    .bind(config.id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Find a configuration by ID
pub async fn find_by_id(
    pool: &SqlitePool,
    id: Uuid,
) -> Result<Option<BuildConfiguration>, sqlx::Error> {
    let row = sqlx::query_as::<_, ConfigurationRow>("SELECT body FROM configurations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.body.0))
}

/// List configurations, optionally restricted to a group, ordered by name
pub async fn list(
    pool: &SqlitePool,
    group: Option<&str>,
    limit: u32,
    offset: u64,
) -> Result<Vec<BuildConfiguration>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ConfigurationRow>(
        r#"
        SELECT body FROM configurations
        WHERE (? IS NULL OR group_name = ?)
        ORDER BY name ASC, created_at ASC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(group)
    .bind(group)
    .bind(i64::from(limit))
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.body.0).collect())
}

/// Count configurations, optionally restricted to a group
pub async fn count(pool: &SqlitePool, group: Option<&str>) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM configurations WHERE (? IS NULL OR group_name = ?)",
    )
    .bind(group)
    .bind(group)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Every configuration, used by the retention sweep
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<BuildConfiguration>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ConfigurationRow>("SELECT body FROM configurations")
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|r| r.body.0).collect())
}

/// Distinct non-empty group labels
pub async fn list_groups(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT group_name FROM configurations
        WHERE group_name IS NOT NULL AND group_name <> ''
        ORDER BY group_name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(g,)| g).collect())
}

/// Enabled configurations carrying a cron expression
pub async fn list_scheduled(pool: &SqlitePool) -> Result<Vec<BuildConfiguration>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ConfigurationRow>(
        "SELECT body FROM configurations WHERE enabled = 1 AND cron IS NOT NULL AND cron <> ''",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.body.0).collect())
}

/// Delete a configuration by ID
pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM configurations WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ConfigurationRow {
    body: Json<BuildConfiguration>,
}

/// Reserves the next run number of a configuration
///
/// The counter lives on the configuration row, so numbers freed by deleted
/// or pruned runs are never handed out again.
pub async fn reserve_run_number(pool: &SqlitePool, id: Uuid) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        r#"
        UPDATE configurations
        SET last_run_number = MAX(
            last_run_number,
            (SELECT COALESCE(MAX(number), 0) FROM runs WHERE configuration_id = ?)
        ) + 1
        WHERE id = ?
        RETURNING last_run_number
        "#,
    )
    .bind(id)
    .bind(id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}
