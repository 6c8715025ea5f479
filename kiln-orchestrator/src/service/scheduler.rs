//! Background loops
//!
//! The cron scheduler fires scheduled triggers and the retention loop runs
//! the history sweep. Both tick on a fixed interval and log errors instead
//! of stopping.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::repository::configuration_repository;
use crate::service::history::HistoryStore;
use crate::service::trigger::{ScheduledOutcome, TriggerDispatcher};

/// Parses a 5-field (minute precision) or 6/7-field (second precision) cron expression
pub fn parse_cron(expression: &str) -> Result<Schedule, cron::error::Error> {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {}", expression))
    } else {
        Schedule::from_str(expression)
    }
}

/// Whether `schedule` has an occurrence in `(since, now]`
pub fn is_due(schedule: &Schedule, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    schedule
        .after(&since)
        .next()
        .is_some_and(|next| next <= now)
}

pub struct CronScheduler {
    dispatcher: Arc<TriggerDispatcher>,
    interval: Duration,
    last_tick: DateTime<Utc>,
}

impl CronScheduler {
    pub fn new(dispatcher: Arc<TriggerDispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
            last_tick: Utc::now(),
        }
    }

    /// Starts the evaluation loop
    pub async fn run(mut self) {
        tracing::info!("Starting cron scheduler (interval: {:?})", self.interval);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let fired = self.tick(Utc::now()).await;
            if fired > 0 {
                tracing::info!("Scheduler fired {} run(s) this tick", fired);
            }
        }
    }

    /// Fires every configuration whose schedule elapsed since the previous tick
    ///
    /// Each configuration fires at most once per tick, however many
    /// occurrences were missed.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let since = self.last_tick;
        self.last_tick = now;

        let pool = self.dispatcher.engine().services().history.pool();
        let configs = match configuration_repository::list_scheduled(pool).await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::error!("Failed to load scheduled configurations: {}", e);
                return 0;
            }
        };

        let mut fired = 0;
        for config in configs {
            let Some(cron) = config.triggers.cron.as_deref() else {
                continue;
            };
            let schedule = match parse_cron(cron) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!("Configuration {} has an invalid cron '{}': {}", config.id, cron, e);
                    continue;
                }
            };
            if !is_due(&schedule, since, now) {
                continue;
            }

            tracing::debug!("Schedule '{}' of configuration {} is due", cron, config.id);
            match self.dispatcher.scheduled(config.id, cron).await {
                Ok(ScheduledOutcome::Accepted(_)) => fired += 1,
                Ok(ScheduledOutcome::Skipped { .. }) => {}
                Err(e) => {
                    tracing::warn!("Scheduled trigger of configuration {} rejected: {}", config.id, e)
                }
            }
        }
        fired
    }
}

/// Runs the retention sweep every `interval`
pub async fn run_retention(history: HistoryStore, interval: Duration) {
    tracing::info!("Starting retention sweep loop (interval: {:?})", interval);

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = history.sweep_retention(Utc::now()).await {
            tracing::error!("Retention sweep failed: {}", e);
        }
    }
}
