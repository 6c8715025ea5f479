//! Configuration API Handlers
//!
//! HTTP endpoints for build configuration management.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use kiln_core::domain::configuration::BuildConfiguration;
use kiln_core::domain::trigger::TriggerEvent;
use kiln_core::dto::batch::{BatchDelete, BatchDeleteResult};
use kiln_core::dto::configuration::{ConfigurationQuery, CreateConfiguration, TriggerUrl};
use kiln_core::dto::page::Page;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::configuration_service;

/// POST /configurations
/// Create a new configuration
pub async fn create_configuration(
    State(state): State<AppState>,
    Json(req): Json<CreateConfiguration>,
) -> ApiResult<(StatusCode, Json<BuildConfiguration>)> {
    tracing::info!("Creating configuration: {}", req.name);

    let config = configuration_service::create_configuration(&state.engine, req).await?;
    Ok((StatusCode::CREATED, Json(config)))
}

/// GET /configurations
/// List configurations, optionally filtered by group
pub async fn list_configurations(
    State(state): State<AppState>,
    Query(query): Query<ConfigurationQuery>,
) -> ApiResult<Json<Page<BuildConfiguration>>> {
    tracing::debug!("Listing configurations (group: {:?})", query.group);

    let page = configuration_service::list_configurations(&state.engine, &query).await?;
    Ok(Json(page))
}

/// GET /configurations/groups
pub async fn list_groups(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(configuration_service::list_groups(&state.engine).await?))
}

/// GET /configurations/{id}
pub async fn get_configuration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BuildConfiguration>> {
    tracing::debug!("Getting configuration: {}", id);

    let config = configuration_service::get_configuration(&state.engine, id).await?;
    Ok(Json(config))
}

/// PUT /configurations/{id}
/// Replace a configuration
pub async fn update_configuration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateConfiguration>,
) -> ApiResult<Json<BuildConfiguration>> {
    tracing::info!("Updating configuration: {}", id);

    let config = configuration_service::update_configuration(&state.engine, id, req).await?;
    Ok(Json(config))
}

/// DELETE /configurations/{id}
/// Delete a configuration together with its history
pub async fn delete_configuration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting configuration: {}", id);

    configuration_service::delete_configuration(&state.engine, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /configurations
/// Delete several configurations; each is handled like a single delete
pub async fn delete_configurations(
    State(state): State<AppState>,
    Json(req): Json<BatchDelete>,
) -> ApiResult<Json<BatchDeleteResult>> {
    tracing::info!("Deleting {} configuration(s)", req.ids.len());

    let mut result = BatchDeleteResult::default();
    for id in req.ids {
        match configuration_service::delete_configuration(&state.engine, id).await {
            Ok(()) => result.deleted.push(id),
            Err(e) => result.failed.push(ApiError::from(e).into_batch_failure(id)),
        }
    }
    Ok(Json(result))
}

/// POST /configurations/{id}/reset-token
pub async fn reset_token(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TriggerUrl>> {
    let url = configuration_service::reset_webhook_token(&state.engine, id).await?;
    Ok(Json(url))
}

/// GET /configurations/{id}/trigger-url
pub async fn trigger_url(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TriggerUrl>> {
    let url = configuration_service::trigger_url(&state.engine, id).await?;
    Ok(Json(url))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// GET /configurations/{id}/triggers
/// Trigger audit trail, newest first
pub async fn list_trigger_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<TriggerEvent>>> {
    // Unknown configurations are a 404, not an empty page
    configuration_service::get_configuration(&state.engine, id).await?;

    let events = state
        .engine
        .services()
        .history
        .trigger_events(id, query.page, query.page_size)
        .await?;
    Ok(Json(events))
}
