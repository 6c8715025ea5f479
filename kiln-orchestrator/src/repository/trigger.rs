//! Trigger Event Repository
//!
//! Append-only audit of trigger attempts.

use kiln_core::domain::trigger::{Trigger, TriggerEvent, TriggerOutcome};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{from_millis, to_millis};
use crate::repository::run::string_to_source;

/// Append a trigger event
pub async fn create(pool: &SqlitePool, event: &TriggerEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO trigger_events (id, configuration_id, source, identity, outcome, run_id, detail, at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.id)
    .bind(event.configuration_id)
    .bind(event.trigger.source.to_string())
    .bind(&event.trigger.identity)
    .bind(outcome_to_string(event.outcome))
    .bind(event.run_id)
    .bind(&event.detail)
    .bind(to_millis(event.at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent events of a configuration, newest first
pub async fn list_by_configuration(
    pool: &SqlitePool,
    configuration_id: Uuid,
    limit: u32,
    offset: u64,
) -> Result<Vec<TriggerEvent>, sqlx::Error> {
    let rows = sqlx::query_as::<_, TriggerEventRow>(
        r#"
        SELECT id, configuration_id, source, identity, outcome, run_id, detail, at
        FROM trigger_events
        WHERE configuration_id = ?
        ORDER BY at DESC, rowid DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(configuration_id)
    .bind(i64::from(limit))
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TriggerEvent::try_from).collect()
}

pub async fn count_by_configuration(
    pool: &SqlitePool,
    configuration_id: Uuid,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM trigger_events WHERE configuration_id = ?")
            .bind(configuration_id)
            .fetch_one(pool)
            .await?;

    Ok(row.0)
}

/// Drop the audit trail of a deleted configuration
pub async fn delete_by_configuration(
    pool: &SqlitePool,
    configuration_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM trigger_events WHERE configuration_id = ?")
        .bind(configuration_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn outcome_to_string(outcome: TriggerOutcome) -> &'static str {
    match outcome {
        TriggerOutcome::Accepted => "accepted",
        TriggerOutcome::Skipped => "skipped",
        TriggerOutcome::Rejected => "rejected",
    }
}

fn string_to_outcome(s: &str) -> Option<TriggerOutcome> {
    match s {
        "accepted" => Some(TriggerOutcome::Accepted),
        "skipped" => Some(TriggerOutcome::Skipped),
        "rejected" => Some(TriggerOutcome::Rejected),
        _ => None,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TriggerEventRow {
    id: Uuid,
    configuration_id: Uuid,
    source: String,
    identity: String,
    outcome: String,
    run_id: Option<Uuid>,
    detail: Option<String>,
    at: i64,
}

impl TryFrom<TriggerEventRow> for TriggerEvent {
    type Error = sqlx::Error;

    fn try_from(row: TriggerEventRow) -> Result<Self, Self::Error> {
        let source = string_to_source(&row.source).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown trigger source '{}'", row.source).into())
        })?;
        let outcome = string_to_outcome(&row.outcome).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown trigger outcome '{}'", row.outcome).into())
        })?;

        Ok(TriggerEvent {
            id: row.id,
            configuration_id: row.configuration_id,
            trigger: Trigger::new(source, row.identity),
            outcome,
            run_id: row.run_id,
            detail: row.detail,
            at: from_millis(row.at),
        })
    }
}
