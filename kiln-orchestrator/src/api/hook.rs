//! Hook API Handler
//!
//! Inbound trigger endpoint for external systems. The configuration's token
//! travels as a bearer credential, never in the URI, so request tracing
//! cannot record it. Failures never say which part was wrong.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
};
use kiln_core::dto::run::{HookTrigger, SubmitResponse};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::trigger::TriggerError;

/// POST /hook/{configuration_id}
/// Trigger a run, authenticated by `Authorization: Bearer <token>`
///
/// The body is optional; when present it may override the branch.
pub async fn trigger_hook(
    State(state): State<AppState>,
    Path(configuration_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let token = bearer_token(&headers).ok_or(TriggerError::Unauthorized)?;

    let hook: HookTrigger = if body.iter().all(u8::is_ascii_whitespace) {
        HookTrigger::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid hook body: {}", e)))?
    };

    let run = state
        .dispatcher
        .hook(configuration_id, token, hook.branch)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            run_id: run.id,
            number: run.number,
        }),
    ))
}

/// Token of an `Authorization: Bearer` header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
}
