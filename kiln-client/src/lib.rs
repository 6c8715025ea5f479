//! Kiln HTTP Client
//!
//! A simple, type-safe HTTP client for communicating with the Kiln orchestrator API.
//!
//! # Example
//!
//! ```no_run
//! use kiln_client::OrchestratorClient;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     // Start a run and read its first batch of output
//!     let submitted = client.submit_run(Uuid::new_v4(), Some("alice"), None).await?;
//!     let tail = client.tail_log(submitted.run_id, 1, None).await?;
//!
//!     println!("Run #{}: {} line(s)", submitted.number, tail.lines.len());
//!     Ok(())
//! }
//! ```

mod configurations;
pub mod error;
mod runs;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Health report of the orchestrator
#[derive(Debug, Clone, Deserialize)]
pub struct Health {
    pub status: String,
    pub active_runs: usize,
}

/// HTTP client for the Kiln orchestrator API
///
/// This client provides methods for all orchestrator API endpoints, organized
/// into logical groups:
/// - Configuration management (create, list, update, delete, trigger tokens)
/// - Run lifecycle (submit, cancel, status, history, rollback)
/// - Log tailing and artifact download
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the orchestrator API (e.g., "http://localhost:8080")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the orchestrator is up
    pub async fn health(&self) -> Result<Health> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Turn a non-success response into an API error
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("Orchestrator returned {}: {}", status, error_text);
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        self.check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content (e.g., DELETE operations)
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        self.check_status(response).await?;
        Ok(())
    }

    /// Handle an API response with a raw body
    async fn handle_bytes(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let bytes = self.check_status(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OrchestratorClient::new("http://localhost:8080");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = OrchestratorClient::new("http://localhost:8080//");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_health_body_shape() {
        let health: Health = serde_json::from_str(r#"{"status":"ok","active_runs":2}"#).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_runs, 2);
    }
}
