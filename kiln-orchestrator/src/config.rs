//! Orchestrator configuration
//!
//! Defines all configurable parameters for the orchestrator including
//! storage locations, default stage budgets and background loop intervals.

use std::path::PathBuf;
use std::time::Duration;

use kiln_core::domain::configuration::StageTimeouts;
use kiln_core::domain::run::Stage;

/// Orchestrator configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, small vs large builds).
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (e.g., "0.0.0.0:8080")
    pub bind_addr: String,

    /// SQLite database URL for the history store
    pub database_url: String,

    /// Root directory for workspaces, artifacts and flushed logs
    pub data_dir: PathBuf,

    /// Default per-stage budgets, overridable per configuration
    pub fetch_timeout: Duration,
    pub build_timeout: Duration,
    pub package_timeout: Duration,
    pub release_timeout: Duration,

    /// Time a build process gets to exit after the terminate signal
    pub cancel_grace: Duration,

    /// Bounded retries for transient fetch errors
    pub fetch_retries: u32,

    /// How often cron schedules are evaluated
    pub scheduler_interval: Duration,

    /// How often the retention sweep runs
    pub retention_interval: Duration,

    /// Upper bound for flushing a finished run's log to disk
    pub log_flush_timeout: Duration,

    /// Shell used to execute build scripts
    pub shell: String,
}

impl Config {
    /// Creates a new configuration with defaults rooted at `data_dir`
    pub fn new(data_dir: PathBuf) -> Self {
        let database_url = format!("sqlite://{}", data_dir.join("kiln.db").display());
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url,
            data_dir,
            fetch_timeout: Duration::from_secs(300),
            build_timeout: Duration::from_secs(3600),
            package_timeout: Duration::from_secs(300),
            release_timeout: Duration::from_secs(600),
            cancel_grace: Duration::from_secs(10),
            fetch_retries: 3,
            scheduler_interval: Duration::from_secs(30),
            retention_interval: Duration::from_secs(3600),
            log_flush_timeout: Duration::from_secs(10),
            shell: "sh".to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional:
    /// - KILN_DATA_DIR (default: ./data)
    /// - KILN_BIND_ADDR (default: 0.0.0.0:8080)
    /// - KILN_DATABASE_URL (default: sqlite://<data_dir>/kiln.db)
    /// - KILN_FETCH_TIMEOUT, KILN_BUILD_TIMEOUT, KILN_PACKAGE_TIMEOUT,
    ///   KILN_RELEASE_TIMEOUT (seconds)
    /// - KILN_CANCEL_GRACE (seconds, default: 10)
    /// - KILN_FETCH_RETRIES (default: 3)
    /// - KILN_SCHEDULER_INTERVAL (seconds, default: 30)
    /// - KILN_RETENTION_INTERVAL (seconds, default: 3600)
    /// - KILN_LOG_FLUSH_TIMEOUT (seconds, default: 10)
    /// - KILN_SHELL (default: sh)
    pub fn from_env() -> Self {
        let data_dir = std::env::var("KILN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let mut config = Self::new(data_dir);

        if let Ok(addr) = std::env::var("KILN_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("KILN_DATABASE_URL") {
            config.database_url = url;
        }

        config.fetch_timeout = env_secs("KILN_FETCH_TIMEOUT").unwrap_or(config.fetch_timeout);
        config.build_timeout = env_secs("KILN_BUILD_TIMEOUT").unwrap_or(config.build_timeout);
        config.package_timeout =
            env_secs("KILN_PACKAGE_TIMEOUT").unwrap_or(config.package_timeout);
        config.release_timeout =
            env_secs("KILN_RELEASE_TIMEOUT").unwrap_or(config.release_timeout);
        config.cancel_grace = env_secs("KILN_CANCEL_GRACE").unwrap_or(config.cancel_grace);
        config.scheduler_interval =
            env_secs("KILN_SCHEDULER_INTERVAL").unwrap_or(config.scheduler_interval);
        config.retention_interval =
            env_secs("KILN_RETENTION_INTERVAL").unwrap_or(config.retention_interval);
        config.log_flush_timeout =
            env_secs("KILN_LOG_FLUSH_TIMEOUT").unwrap_or(config.log_flush_timeout);

        config.fetch_retries = std::env::var("KILN_FETCH_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(config.fetch_retries);

        if let Ok(shell) = std::env::var("KILN_SHELL") {
            config.shell = shell;
        }

        config
    }

    /// Resolves the budget of `stage`, preferring the configuration's override
    pub fn stage_timeout(&self, stage: Stage, overrides: &StageTimeouts) -> Duration {
        let (custom, default) = match stage {
            Stage::Fetch => (overrides.fetch_seconds, self.fetch_timeout),
            Stage::Build => (overrides.build_seconds, self.build_timeout),
            Stage::Package => (overrides.package_seconds, self.package_timeout),
            Stage::Release => (overrides.release_seconds, self.release_timeout),
        };
        custom.map(Duration::from_secs).unwrap_or(default)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if !self.database_url.starts_with("sqlite:") {
            anyhow::bail!("database_url must be a sqlite: URL");
        }

        for (name, value) in [
            ("fetch_timeout", self.fetch_timeout),
            ("build_timeout", self.build_timeout),
            ("package_timeout", self.package_timeout),
            ("release_timeout", self.release_timeout),
            ("scheduler_interval", self.scheduler_interval),
            ("retention_interval", self.retention_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.shell.trim().is_empty() {
            anyhow::bail!("shell cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(PathBuf::from("./data"))
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}
