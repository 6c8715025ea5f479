//! API Error Handling
//!
//! Unified error types and conversion for API responses. Every error body
//! is `{"error": <message>, "code": <machine readable code>}`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kiln_core::dto::batch::BatchFailure;
use uuid::Uuid;

use crate::service::configuration::ConfigurationError;
use crate::service::engine::EngineError;
use crate::service::history::HistoryError;
use crate::service::log_sink::LogError;
use crate::service::trigger::TriggerError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    AlreadyRunning { message: String, run_id: Uuid },
    ConfigurationDisabled(String),
    NotFound(String),
    AlreadyTerminal(String),
    Unauthorized,
    BadRequest(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AlreadyRunning { .. } => "already-running",
            ApiError::ConfigurationDisabled(_) => "configuration-disabled",
            ApiError::NotFound(_) => "not-found",
            ApiError::AlreadyTerminal(_) => "already-terminal",
            ApiError::Unauthorized => "unauthorized",
            ApiError::BadRequest(_) => "bad-request",
            ApiError::DatabaseError(_) | ApiError::InternalError(_) => "internal",
        }
    }

    /// Entry for one failed item of a batch call
    pub fn into_batch_failure(self, id: Uuid) -> BatchFailure {
        let code = self.code().to_string();
        let (_, error, _) = self.into_parts();
        BatchFailure { id, code, error }
    }

    /// Status, client-facing message and conflicting run
    fn into_parts(self) -> (StatusCode, String, Option<Uuid>) {
        let mut run_id = None;

        let (status, message) = match self {
            ApiError::AlreadyRunning { message, run_id: id } => {
                run_id = Some(id);
                (StatusCode::CONFLICT, message)
            }
            ApiError::ConfigurationDisabled(msg) => (StatusCode::CONFLICT, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::AlreadyTerminal(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, message, run_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message, run_id) = self.into_parts();

        let mut body = serde_json::json!({ "error": message, "code": code });
        if let Some(run_id) = run_id {
            body["run_id"] = serde_json::json!(run_id);
        }
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<HistoryError> for ApiError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::NotFound(id) => ApiError::NotFound(format!("Run {} not found", id)),
            HistoryError::RunActive(id) => {
                ApiError::BadRequest(format!("Run {} is still active", id))
            }
            HistoryError::Database(err) => ApiError::DatabaseError(err),
            HistoryError::Io(err) => ApiError::InternalError(format!("Storage error: {}", err)),
        }
    }
}

impl From<LogError> for ApiError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::NotFound(id) => ApiError::NotFound(format!("No log for run {}", id)),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ConfigurationNotFound(id) => {
                ApiError::NotFound(format!("Configuration {} not found", id))
            }
            EngineError::ConfigurationDisabled(id) => {
                ApiError::ConfigurationDisabled(format!("Configuration {} is disabled", id))
            }
            EngineError::AlreadyRunning {
                configuration_id,
                run_id,
            } => ApiError::AlreadyRunning {
                message: format!(
                    "Configuration {} already has active run {}",
                    configuration_id, run_id
                ),
                run_id,
            },
            EngineError::RunNotFound(id) => ApiError::NotFound(format!("Run {} not found", id)),
            EngineError::AlreadyTerminal(id) => {
                ApiError::AlreadyTerminal(format!("Run {} is already terminal", id))
            }
            EngineError::ArtifactNotFound(id) => {
                ApiError::NotFound(format!("No artifact is retained for run {}", id))
            }
            EngineError::NoReleaseMethod(id) => ApiError::BadRequest(format!(
                "Configuration {} has no release method to roll back with",
                id
            )),
            EngineError::History(err) => err.into(),
            EngineError::Log(err) => err.into(),
            EngineError::Database(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Unauthorized => ApiError::Unauthorized,
            TriggerError::InvalidSource(source) => {
                ApiError::BadRequest(format!("Trigger source {} cannot be submitted", source))
            }
            TriggerError::Engine(err) => err.into(),
        }
    }
}

impl From<ConfigurationError> for ApiError {
    fn from(err: ConfigurationError) -> Self {
        match err {
            ConfigurationError::NotFound(id) => {
                ApiError::NotFound(format!("Configuration {} not found", id))
            }
            ConfigurationError::Validation(msg) => ApiError::BadRequest(msg),
            ConfigurationError::RunActive {
                configuration_id,
                run_id,
            } => ApiError::AlreadyRunning {
                message: format!(
                    "Configuration {} has active run {}; only name and group may change",
                    configuration_id, run_id
                ),
                run_id,
            },
            ConfigurationError::WebhookDisabled(id) => ApiError::NotFound(format!(
                "Webhook triggering is disabled for configuration {}",
                id
            )),
            ConfigurationError::History(err) => err.into(),
            ConfigurationError::Database(err) => ApiError::DatabaseError(err),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_already_running_carries_run_id() {
        let run_id = Uuid::new_v4();
        let err: ApiError = EngineError::AlreadyRunning {
            configuration_id: Uuid::new_v4(),
            run_id,
        }
        .into();

        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "already-running");
        assert_eq!(body["run_id"], run_id.to_string());
    }

    #[tokio::test]
    async fn test_unauthorized_is_generic() {
        let (status, body) = body_of(TriggerError::Unauthorized.into()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_pruned_artifact_is_not_found() {
        let (status, body) = body_of(EngineError::ArtifactNotFound(Uuid::nil()).into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not-found");
    }

    #[test]
    fn test_batch_failure_keeps_code_and_message() {
        let id = Uuid::new_v4();
        let failure = ApiError::from(HistoryError::RunActive(id)).into_batch_failure(id);
        assert_eq!(failure.id, id);
        assert_eq!(failure.code, "bad-request");
        assert_eq!(failure.error, format!("Run {} is still active", id));
    }
}
