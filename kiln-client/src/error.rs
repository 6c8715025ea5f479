//! Error types for the Kiln client

use serde::Deserialize;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when using the Kiln client
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Machine readable code, e.g. `already-running`
        code: Option<String>,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

/// Error body returned by the orchestrator
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: Option<String>,
}

impl ClientError {
    /// Create an API error from status code and response body
    ///
    /// Bodies that are not the orchestrator's JSON error shape are kept verbatim.
    pub fn api_error(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => Self::ApiError {
                status,
                code: parsed.code,
                message: parsed.error,
            },
            Err(_) => Self::ApiError {
                status,
                code: None,
                message: body,
            },
        }
    }

    /// Machine readable error code, if the API sent one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::ApiError { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if the configuration already had an active run
    pub fn is_already_running(&self) -> bool {
        self.code() == Some("already-running")
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 400 && *status < 500)
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_orchestrator_error_body() {
        let err = ClientError::api_error(
            409,
            r#"{"error":"Configuration x already has active run y","code":"already-running"}"#,
        );
        assert!(err.is_already_running());
        assert!(err.is_client_error());
        assert!(err.to_string().contains("already has active run"));
    }

    #[test]
    fn test_keeps_plain_bodies() {
        let err = ClientError::api_error(502, "Bad Gateway");
        assert_eq!(err.code(), None);
        assert!(err.is_server_error());
        assert!(err.to_string().contains("Bad Gateway"));
    }

    #[test]
    fn test_not_found() {
        let err = ClientError::api_error(404, r#"{"error":"Run 1 not found","code":"not-found"}"#);
        assert!(err.is_not_found());
        assert_eq!(err.code(), Some("not-found"));
    }
}
