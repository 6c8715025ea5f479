//! History Store
//!
//! Durable record of every run, the trigger audit trail and the retention
//! sweep that prunes old runs together with their artifacts and logs.

use chrono::{DateTime, Utc};
use kiln_core::domain::run::Run;
use kiln_core::domain::trigger::TriggerEvent;
use kiln_core::dto::page::{self, Page};
use kiln_core::dto::run::RunQuery;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::repository::run::RunFilter;
use crate::repository::{configuration_repository, run_repository, trigger_repository};
use crate::storage::DataLayout;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("run {0} not found")]
    NotFound(Uuid),
    #[error("run {0} is still active")]
    RunActive(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// What one retention sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted_runs: usize,
    /// Expired runs kept because they are their configuration's latest success
    pub retained_latest: usize,
}

#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
    layout: DataLayout,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool, layout: DataLayout) -> Self {
        Self { pool, layout }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub async fn insert(&self, run: &Run) -> Result<()> {
        run_repository::create(&self.pool, run).await?;
        Ok(())
    }

    pub async fn update(&self, run: &Run) -> Result<()> {
        if !run_repository::update(&self.pool, run).await? {
            return Err(HistoryError::NotFound(run.id));
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Run> {
        run_repository::find_by_id(&self.pool, id)
            .await?
            .ok_or(HistoryError::NotFound(id))
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(run_repository::find_by_id(&self.pool, id).await?)
    }

    pub async fn find_by_number(&self, configuration_id: Uuid, number: i64) -> Result<Option<Run>> {
        Ok(run_repository::find_by_number(&self.pool, configuration_id, number).await?)
    }

    pub async fn active_for(&self, configuration_id: Uuid) -> Result<Option<Run>> {
        Ok(run_repository::find_active_for_configuration(&self.pool, configuration_id).await?)
    }

    pub async fn non_terminal(&self) -> Result<Vec<Run>> {
        Ok(run_repository::find_non_terminal(&self.pool).await?)
    }

    pub async fn next_number(&self, configuration_id: Uuid) -> Result<i64> {
        Ok(configuration_repository::reserve_run_number(&self.pool, configuration_id).await?)
    }

    /// Paginated run listing, newest first by default
    pub async fn query(&self, query: &RunQuery) -> Result<Page<Run>> {
        let (page, page_size, offset) = page::normalize(query.page, query.page_size);
        let filter = RunFilter {
            configuration_id: query.configuration_id,
            status: query.status,
            since: query.since,
            until: query.until,
            ascending: query.ascending,
        };

        let total = run_repository::count(&self.pool, &filter).await?;
        if total == 0 {
            return Ok(Page::empty(page, page_size));
        }
        let items = run_repository::query(&self.pool, &filter, page_size, offset).await?;

        Ok(Page {
            items,
            total: total as u64,
            page,
            page_size,
        })
    }

    /// Deletes a terminal run with its artifact and flushed log
    pub async fn delete_run(&self, id: Uuid) -> Result<()> {
        let run = self.get(id).await?;
        if !run.status.is_terminal() {
            return Err(HistoryError::RunActive(id));
        }

        run_repository::delete_terminal(&self.pool, id).await?;
        self.layout.remove_run_files(id).await?;

        tracing::info!("Deleted run {} of configuration {}", id, run.configuration_id);
        Ok(())
    }

    /// Deletes every terminal run of a configuration and its audit trail
    pub async fn purge_configuration(&self, configuration_id: Uuid) -> Result<usize> {
        let ids = run_repository::find_terminal_ids(&self.pool, configuration_id).await?;
        for id in &ids {
            run_repository::delete_terminal(&self.pool, *id).await?;
            self.layout.remove_run_files(*id).await?;
        }
        trigger_repository::delete_by_configuration(&self.pool, configuration_id).await?;
        Ok(ids.len())
    }

    /// Prunes expired runs of every configuration with a retention policy
    ///
    /// A run expires when it is terminal and completed more than
    /// `retention_days` before `now`. The newest succeeded or partially
    /// succeeded run is always kept so a rollback target survives. Running
    /// the sweep twice deletes nothing the second time.
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for config in configuration_repository::list_all(&self.pool).await? {
            let Some(days) = config.retention_days else {
                continue;
            };

            let cutoff = now - chrono::Duration::days(i64::from(days));
            let keep = run_repository::latest_success(&self.pool, config.id).await?;

            for id in run_repository::find_expired(&self.pool, config.id, cutoff).await? {
                if Some(id) == keep {
                    report.retained_latest += 1;
                    continue;
                }
                if run_repository::delete_terminal(&self.pool, id).await? {
                    report.deleted_runs += 1;
                }
                self.layout.remove_run_files(id).await?;
            }
        }

        if report.deleted_runs > 0 {
            tracing::info!(
                "Retention sweep deleted {} run(s), kept {} latest success(es)",
                report.deleted_runs,
                report.retained_latest
            );
        } else {
            tracing::debug!("Retention sweep found nothing to delete");
        }

        Ok(report)
    }

    pub async fn record_trigger(&self, event: &TriggerEvent) -> Result<()> {
        trigger_repository::create(&self.pool, event).await?;
        Ok(())
    }

    pub async fn trigger_events(
        &self,
        configuration_id: Uuid,
        page: Option<u32>,
        page_size: Option<u32>,
    ) -> Result<Page<TriggerEvent>> {
        let (page, page_size, offset) = page::normalize(page, page_size);
        let total = trigger_repository::count_by_configuration(&self.pool, configuration_id).await?;
        let items =
            trigger_repository::list_by_configuration(&self.pool, configuration_id, page_size, offset)
                .await?;

        Ok(Page {
            items,
            total: total as u64,
            page,
            page_size,
        })
    }
}
