//! Run Repository
//!
//! Handles all database operations related to runs.

use kiln_core::domain::configuration::BuildConfiguration;
use kiln_core::domain::release::ReleaseOutcome;
use kiln_core::domain::run::{Artifact, Run, RunFailure, RunKind, RunStatus};
use kiln_core::domain::trigger::{Trigger, TriggerSource};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::{from_millis, to_millis};

const RUN_COLUMNS: &str = r#"
    id, configuration_id, number, kind, status, trigger_source, trigger_identity,
    requested_at, started_at, completed_at, exit_code, snapshot, artifact, release, failure
"#;

const NON_TERMINAL: &str =
    "status NOT IN ('succeeded', 'partial_success', 'failed', 'cancelled')";

/// Filter for paginated run queries
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub configuration_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub ascending: bool,
}

/// Insert a newly admitted run
pub async fn create(pool: &SqlitePool, run: &Run) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO runs (
            id, configuration_id, number, kind, status, trigger_source, trigger_identity,
            requested_at, started_at, completed_at, exit_code, snapshot, artifact, release, failure
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run.id)
    .bind(run.configuration_id)
    .bind(run.number)
    .bind(Json(&run.kind))
    .bind(run.status.as_str())
    .bind(source_to_string(run.trigger.source))
    .bind(&run.trigger.identity)
    .bind(to_millis(run.requested_at))
    .bind(run.started_at.map(to_millis))
    .bind(run.completed_at.map(to_millis))
    .bind(run.exit_code)
    .bind(Json(&run.snapshot))
    .bind(run.artifact.as_ref().map(Json))
    .bind(run.release.as_ref().map(Json))
    .bind(run.failure.as_ref().map(Json))
    .execute(pool)
    .await?;

    Ok(())
}

/// Write back the mutable fields of a run
pub async fn update(pool: &SqlitePool, run: &Run) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = ?, started_at = ?, completed_at = ?, exit_code = ?,
            artifact = ?, release = ?, failure = ?
        WHERE id = ?
        "#,
    )
    .bind(run.status.as_str())
    .bind(run.started_at.map(to_millis))
    .bind(run.completed_at.map(to_millis))
    .bind(run.exit_code)
    .bind(run.artifact.as_ref().map(Json))
    .bind(run.release.as_ref().map(Json))
    .bind(run.failure.as_ref().map(Json))
    .bind(run.id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Find a run by ID
pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Run>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(&format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(Run::try_from).transpose()
}

/// Find a run by its per-configuration number
pub async fn find_by_number(
    pool: &SqlitePool,
    configuration_id: Uuid,
    number: i64,
) -> Result<Option<Run>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {} FROM runs WHERE configuration_id = ? AND number = ?",
        RUN_COLUMNS
    ))
    .bind(configuration_id)
    .bind(number)
    .fetch_optional(pool)
    .await?;

    row.map(Run::try_from).transpose()
}

/// Find the non-terminal run of a configuration, if any
pub async fn find_active_for_configuration(
    pool: &SqlitePool,
    configuration_id: Uuid,
) -> Result<Option<Run>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {} FROM runs WHERE configuration_id = ? AND {} ORDER BY number DESC LIMIT 1",
        RUN_COLUMNS, NON_TERMINAL
    ))
    .bind(configuration_id)
    .fetch_optional(pool)
    .await?;

    row.map(Run::try_from).transpose()
}

/// Every run not yet in a terminal status
pub async fn find_non_terminal(pool: &SqlitePool) -> Result<Vec<Run>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {} FROM runs WHERE {} ORDER BY requested_at ASC",
        RUN_COLUMNS, NON_TERMINAL
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Run::try_from).collect()
}

/// Paginated query, newest first unless `filter.ascending`
pub async fn query(
    pool: &SqlitePool,
    filter: &RunFilter,
    limit: u32,
    offset: u64,
) -> Result<Vec<Run>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM runs", RUN_COLUMNS));
    push_filter(&mut builder, filter);

    let order = if filter.ascending { "ASC" } else { "DESC" };
    builder.push(format!(
        " ORDER BY requested_at {order}, number {order} LIMIT "
    ));
    builder.push_bind(i64::from(limit));
    builder.push(" OFFSET ");
    builder.push_bind(offset as i64);

    let rows = builder.build_query_as::<RunRow>().fetch_all(pool).await?;
    rows.into_iter().map(Run::try_from).collect()
}

/// Number of runs matching a filter
pub async fn count(pool: &SqlitePool, filter: &RunFilter) -> Result<i64, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM runs");
    push_filter(&mut builder, filter);

    let row: (i64,) = builder.build_query_as().fetch_one(pool).await?;
    Ok(row.0)
}

/// Newest run of a configuration that still holds a rollback-eligible artifact
pub async fn latest_success(
    pool: &SqlitePool,
    configuration_id: Uuid,
) -> Result<Option<Uuid>, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM runs
        WHERE configuration_id = ?
          AND status IN ('succeeded', 'partial_success')
          AND artifact IS NOT NULL
        ORDER BY number DESC
        LIMIT 1
        "#,
    )
    .bind(configuration_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id,)| id))
}

/// Terminal runs of a configuration completed before `cutoff`
pub async fn find_expired(
    pool: &SqlitePool,
    configuration_id: Uuid,
    cutoff: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(&format!(
        r#"
        SELECT id FROM runs
        WHERE configuration_id = ? AND NOT ({}) AND completed_at IS NOT NULL AND completed_at < ?
        ORDER BY number ASC
        "#,
        NON_TERMINAL
    ))
    .bind(configuration_id)
    .bind(to_millis(cutoff))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Terminal runs of a configuration, used when the configuration is deleted
pub async fn find_terminal_ids(
    pool: &SqlitePool,
    configuration_id: Uuid,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(&format!(
        "SELECT id FROM runs WHERE configuration_id = ? AND NOT ({})",
        NON_TERMINAL
    ))
    .bind(configuration_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Delete a terminal run by ID; non-terminal rows are never removed
pub async fn delete_terminal(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(&format!("DELETE FROM runs WHERE id = ? AND NOT ({})", NON_TERMINAL))
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &RunFilter) {
    builder.push(" WHERE 1 = 1");

    if let Some(configuration_id) = filter.configuration_id {
        builder.push(" AND configuration_id = ");
        builder.push_bind(configuration_id);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(since) = filter.since {
        builder.push(" AND requested_at >= ");
        builder.push_bind(to_millis(since));
    }
    if let Some(until) = filter.until {
        builder.push(" AND requested_at < ");
        builder.push_bind(to_millis(until));
    }
}

fn source_to_string(source: TriggerSource) -> &'static str {
    match source {
        TriggerSource::Manual => "manual",
        TriggerSource::Api => "api",
        TriggerSource::Webhook => "webhook",
        TriggerSource::Scheduled => "scheduled",
        TriggerSource::Rollback => "rollback",
    }
}

pub(crate) fn string_to_source(s: &str) -> Option<TriggerSource> {
    match s {
        "manual" => Some(TriggerSource::Manual),
        "api" => Some(TriggerSource::Api),
        "webhook" => Some(TriggerSource::Webhook),
        "scheduled" => Some(TriggerSource::Scheduled),
        "rollback" => Some(TriggerSource::Rollback),
        _ => None,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    configuration_id: Uuid,
    number: i64,
    kind: Json<RunKind>,
    status: String,
    trigger_source: String,
    trigger_identity: String,
    requested_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    exit_code: Option<i32>,
    snapshot: Json<BuildConfiguration>,
    artifact: Option<Json<Artifact>>,
    release: Option<Json<ReleaseOutcome>>,
    failure: Option<Json<RunFailure>>,
}

impl TryFrom<RunRow> for Run {
    type Error = sqlx::Error;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<RunStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let source = string_to_source(&row.trigger_source).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown trigger source '{}'", row.trigger_source).into())
        })?;

        Ok(Run {
            id: row.id,
            configuration_id: row.configuration_id,
            number: row.number,
            kind: row.kind.0,
            snapshot: row.snapshot.0,
            status,
            trigger: Trigger::new(source, row.trigger_identity),
            requested_at: from_millis(row.requested_at),
            started_at: row.started_at.map(from_millis),
            completed_at: row.completed_at.map(from_millis),
            exit_code: row.exit_code,
            artifact: row.artifact.map(|a| a.0),
            release: row.release.map(|r| r.0),
            failure: row.failure.map(|f| f.0),
        })
    }
}
