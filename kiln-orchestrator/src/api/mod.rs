//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod configuration;
pub mod error;
pub mod health;
pub mod hook;
pub mod run;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::{Engine, TriggerDispatcher};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub dispatcher: Arc<TriggerDispatcher>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let dispatcher = Arc::new(TriggerDispatcher::new(engine.clone()));
        Self { engine, dispatcher }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Configuration endpoints
        .route(
            "/configurations",
            get(configuration::list_configurations)
                .post(configuration::create_configuration)
                .delete(configuration::delete_configurations),
        )
        .route("/configurations/groups", get(configuration::list_groups))
        .route(
            "/configurations/{id}",
            get(configuration::get_configuration)
                .put(configuration::update_configuration)
                .delete(configuration::delete_configuration),
        )
        .route(
            "/configurations/{id}/reset-token",
            post(configuration::reset_token),
        )
        .route(
            "/configurations/{id}/trigger-url",
            get(configuration::trigger_url),
        )
        .route(
            "/configurations/{id}/triggers",
            get(configuration::list_trigger_events),
        )
        .route(
            "/configurations/{id}/runs/{number}/artifact",
            get(run::get_artifact_by_number),
        )
        .route(
            "/configurations/{id}/runs/{number}/artifact/{*path}",
            get(run::download_artifact_file_by_number),
        )
        // Run endpoints
        .route(
            "/runs",
            get(run::list_runs)
                .post(run::submit_run)
                .delete(run::delete_runs),
        )
        .route("/runs/{id}", get(run::get_run).delete(run::delete_run))
        .route("/runs/{id}/cancel", post(run::cancel_run))
        .route("/runs/{id}/rollback", post(run::rollback_run))
        .route("/runs/{id}/log", get(run::tail_log))
        .route("/runs/{id}/log/download", get(run::download_log))
        .route("/runs/{id}/artifact", get(run::get_artifact))
        .route("/runs/{id}/artifact/{*path}", get(run::download_artifact_file))
        // Inbound hooks
        .route("/hook/{configuration_id}", post(hook::trigger_hook))
        // Add state and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEngine;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use kiln_core::domain::run::RunStatus;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        call_with_token(app, method, uri, None, body).await
    }

    async fn call_with_token(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {}", token));
        }
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    fn configuration_body(name: &str) -> Value {
        json!({
            "name": name,
            "source": { "repository": "fake://repo", "branch": "main", "tag": null },
            "script": "echo building; echo payload > app.bin",
            "result_path": "app.bin",
            "triggers": { "webhook": true }
        })
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let app = create_router(AppState::new(t.engine.clone()));

        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_configuration_and_run_flow() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let app = create_router(AppState::new(t.engine.clone()));

        let (status, config) =
            call(&app, Method::POST, "/configurations", Some(configuration_body("web"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let config_id = config["id"].as_str().unwrap().to_string();

        let (status, submitted) = call(
            &app,
            Method::POST,
            "/runs",
            Some(json!({ "configuration_id": config_id, "operator": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(submitted["number"], 1);
        let run_id: Uuid = submitted["run_id"].as_str().unwrap().parse().unwrap();

        let done = t.engine.wait(run_id).await.unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);

        let (status, run) = call(&app, Method::GET, &format!("/runs/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "succeeded");
        assert_eq!(run["trigger"]["identity"], "alice");

        let (status, tail) =
            call(&app, Method::GET, &format!("/runs/{}/log?from_line=1", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tail["complete"], true);
        let lines = tail["lines"].as_array().unwrap();
        assert_eq!(tail["next_line"], lines.len() as u64 + 1);

        let (status, manifest) =
            call(&app, Method::GET, &format!("/runs/{}/artifact", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(manifest["files"], json!(["app.bin"]));

        let (status, file) = call(
            &app,
            Method::GET,
            &format!("/runs/{}/artifact/app.bin", run_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file, Value::String("payload\n".to_string()));

        let (status, listing) = call(
            &app,
            Method::GET,
            &format!("/runs?configuration_id={}&status=succeeded", config_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["total"], 1);

        let (status, body) = call(&app, Method::POST, &format!("/runs/{}/cancel", run_id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "already-terminal");
    }

    #[tokio::test]
    async fn test_unknown_resources_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let app = create_router(AppState::new(t.engine.clone()));
        let missing = Uuid::new_v4();

        let (status, body) = call(&app, Method::GET, &format!("/runs/{}", missing), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not-found");

        let (status, body) = call(
            &app,
            Method::POST,
            "/runs",
            Some(json!({ "configuration_id": missing })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not-found");

        let (status, _) =
            call(&app, Method::POST, &format!("/runs/{}/cancel", missing), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let app = create_router(AppState::new(t.engine.clone()));

        let mut body = configuration_body("web");
        body["triggers"]["cron"] = json!("whenever");
        let (status, body) = call(&app, Method::POST, "/configurations", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad-request");
    }

    #[tokio::test]
    async fn test_artifact_by_run_number() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let app = create_router(AppState::new(t.engine.clone()));

        let (_, config) =
            call(&app, Method::POST, "/configurations", Some(configuration_body("web"))).await;
        let config_id = config["id"].as_str().unwrap().to_string();

        let (_, submitted) = call(
            &app,
            Method::POST,
            "/runs",
            Some(json!({ "configuration_id": config_id })),
        )
        .await;
        let run_id: Uuid = submitted["run_id"].as_str().unwrap().parse().unwrap();
        t.engine.wait(run_id).await.unwrap();

        let (status, manifest) = call(
            &app,
            Method::GET,
            &format!("/configurations/{}/runs/1/artifact", config_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(manifest["files"], json!(["app.bin"]));

        let (status, file) = call(
            &app,
            Method::GET,
            &format!("/configurations/{}/runs/1/artifact/app.bin", config_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file, Value::String("payload\n".to_string()));

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/configurations/{}/runs/2/artifact", config_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not-found");
    }

    #[tokio::test]
    async fn test_batch_deletes_report_each_item() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let app = create_router(AppState::new(t.engine.clone()));

        let mut config_ids = Vec::new();
        let mut run_ids = Vec::new();
        for name in ["web", "api"] {
            let (_, config) =
                call(&app, Method::POST, "/configurations", Some(configuration_body(name))).await;
            let config_id = config["id"].as_str().unwrap().to_string();
            let (_, submitted) = call(
                &app,
                Method::POST,
                "/runs",
                Some(json!({ "configuration_id": config_id })),
            )
            .await;
            let run_id: Uuid = submitted["run_id"].as_str().unwrap().parse().unwrap();
            t.engine.wait(run_id).await.unwrap();
            config_ids.push(config_id);
            run_ids.push(run_id);
        }

        let missing = Uuid::new_v4();
        let (status, result) = call(
            &app,
            Method::DELETE,
            "/runs",
            Some(json!({ "ids": [run_ids[0], missing] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["deleted"], json!([run_ids[0]]));
        assert_eq!(result["failed"][0]["id"], missing.to_string());
        assert_eq!(result["failed"][0]["code"], "not-found");

        let (status, _) = call(&app, Method::GET, &format!("/runs/{}", run_ids[0]), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, result) = call(
            &app,
            Method::DELETE,
            "/configurations",
            Some(json!({ "ids": [config_ids[0], config_ids[1]] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["deleted"], json!(config_ids));
        assert_eq!(result["failed"], json!([]));

        let (_, listing) = call(&app, Method::GET, "/configurations", None).await;
        assert_eq!(listing["total"], 0);
        let (status, _) = call(&app, Method::GET, &format!("/runs/{}", run_ids[1]), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hook_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let t = TestEngine::new(dir.path()).await;
        let app = create_router(AppState::new(t.engine.clone()));

        let (_, config) =
            call(&app, Method::POST, "/configurations", Some(configuration_body("web"))).await;
        let config_id = config["id"].as_str().unwrap();

        let (status, url) = call(
            &app,
            Method::GET,
            &format!("/configurations/{}/trigger-url", config_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let path = url["path"].as_str().unwrap().to_string();
        let token = url["token"].as_str().unwrap().to_string();
        assert_eq!(path, format!("/hook/{}", config_id));
        assert!(!path.contains(&token));

        let (status, body) = call(&app, Method::POST, &path, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");

        let (status, wrong) =
            call_with_token(&app, Method::POST, &path, Some("wrong-token"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong, body);

        // The token of one configuration does not open another
        let (status, unknown) = call_with_token(
            &app,
            Method::POST,
            &format!("/hook/{}", Uuid::new_v4()),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(unknown, body);

        let (status, submitted) = call_with_token(
            &app,
            Method::POST,
            &path,
            Some(&token),
            Some(json!({ "branch": "hotfix" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id: Uuid = submitted["run_id"].as_str().unwrap().parse().unwrap();
        let run = t.engine.wait(run_id).await.unwrap();
        assert_eq!(run.snapshot.source.branch.as_deref(), Some("hotfix"));

        let (status, events) = call(
            &app,
            Method::GET,
            &format!("/configurations/{}/triggers", config_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events["total"], 1);
        assert_eq!(events["items"][0]["outcome"], "accepted");
    }
}
