//! Configuration module
//!
//! Settings shared by every command.

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the orchestrator service
    pub orchestrator_url: String,
    /// Identity recorded on manual runs and rollbacks
    pub operator: String,
}

impl Config {
    /// Falls back to the login name, then to `cli`
    pub fn new(orchestrator_url: String, operator: Option<String>) -> Self {
        let operator = operator
            .or_else(|| std::env::var("USER").ok())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "cli".to_string());

        Self {
            orchestrator_url,
            operator,
        }
    }
}
