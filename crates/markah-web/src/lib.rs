//! Axum HTTP surface: health, the shared-secret cron trigger and per-user
//! integration settings.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use markah_core::SyncOutcome;
use markah_sync::{maybe_build_scheduler, SyncError, SyncRuntime, RUN_IN_PROGRESS_MESSAGE};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "markah-web";

#[derive(Clone)]
pub struct AppState {
    pub runtime: SyncRuntime,
}

impl AppState {
    pub fn new(runtime: SyncRuntime) -> Self {
        Self { runtime }
    }

    fn cron_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(secret) = self.runtime.config.cron_secret.as_deref() else {
            return false;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token == secret)
    }
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/cron/sync", post(cron_sync_handler))
        .route(
            "/api/users/{user_id}/integration",
            get(integration_status_handler).delete(disconnect_handler),
        )
        .route("/api/users/{user_id}/integration/sync", post(sync_now_handler))
        .route("/api/users/{user_id}/integration/retry", post(retry_handler))
        .route("/api/users/{user_id}/integration/enabled", put(toggle_handler))
        .with_state(Arc::new(state))
}

/// Binds the listener and, when enabled, starts the in-process cron driver.
pub async fn serve(runtime: SyncRuntime) -> anyhow::Result<()> {
    let port = runtime.config.web_port;
    let scheduler = maybe_build_scheduler(&runtime.config, runtime.scheduler.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %runtime.config.sync_cron, "in-process scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(runtime))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncRuntime::from_env(None).await?).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let timestamp = Utc::now().to_rfc3339();
    match state.runtime.store.ping().await {
        Ok(()) => Json(json!({ "status": "ok", "timestamp": timestamp })).into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "timestamp": timestamp })),
            )
                .into_response()
        }
    }
}

async fn cron_sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.cron_authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }
    match state.runtime.scheduler.run_pass().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn integration_status_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Response {
    match state.runtime.integrations.status(user_id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => sync_error(SyncError::NotConnected),
        Err(err) => sync_error(err),
    }
}

async fn sync_now_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Response {
    outcome_response(state.runtime.integrations.sync_now(user_id).await)
}

async fn retry_handler(State(state): State<Arc<AppState>>, Path(user_id): Path<Uuid>) -> Response {
    match state.runtime.integrations.retry(user_id).await {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => sync_error(err),
    }
}

async fn toggle_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<EnabledBody>,
) -> Response {
    match state
        .runtime
        .integrations
        .toggle_sync(user_id, body.enabled)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Response {
    match state.runtime.integrations.disconnect(user_id).await {
        Ok(true) => Json(json!({ "success": true })).into_response(),
        Ok(false) => sync_error(SyncError::NotConnected),
        Err(err) => sync_error(err),
    }
}

fn outcome_response(outcome: SyncOutcome) -> Response {
    let status = match outcome.error.as_deref() {
        Some(RUN_IN_PROGRESS_MESSAGE) => StatusCode::CONFLICT,
        Some(_) if outcome == SyncOutcome::not_connected() => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::NotConnected => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    (
        status,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use markah_adapters::{FixtureFeed, FixturePlatform, NoopTagSuggester};
    use markah_core::{ExternalItem, IntegrationGrant};
    use markah_storage::MemoryStore;
    use markah_sync::SyncConfig;
    use serde_json::Value;
    use tower::ServiceExt;

    fn fixture_feed() -> FixtureFeed {
        FixtureFeed {
            items: (1..=3)
                .rev()
                .map(|id| ExternalItem {
                    external_id: id.to_string(),
                    text: format!("post {id}"),
                    author_handle: "writer".into(),
                    author_name: "Writer".into(),
                    created_at: None,
                    url: format!("https://x.com/writer/status/{id}"),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn runtime(cron_secret: Option<&str>) -> SyncRuntime {
        let config = SyncConfig {
            cron_secret: cron_secret.map(str::to_string),
            ..Default::default()
        };
        SyncRuntime::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(FixturePlatform::new(fixture_feed())),
            Arc::new(NoopTagSuggester),
        )
    }

    async fn connected_user(runtime: &SyncRuntime) -> Uuid {
        let user_id = Uuid::new_v4();
        runtime
            .integrations
            .connect(
                user_id,
                &IntegrationGrant {
                    external_account_id: "42".into(),
                    external_handle: "reader".into(),
                    access_token: "access".into(),
                    refresh_token: "refresh".into(),
                    expires_at: Utc::now() + Duration::hours(1),
                },
            )
            .await
            .unwrap();
        user_id
    }

    fn request(method: &str, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let resp = app(AppState::new(runtime(None)))
            .oneshot(request("GET", "/api/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn cron_requires_configured_secret() {
        let unset = app(AppState::new(runtime(None)))
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/cron/sync")
                    .header(header::AUTHORIZATION, "Bearer anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unset.status(), StatusCode::UNAUTHORIZED);

        let wrong = app(AppState::new(runtime(Some("s3cret"))))
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/cron/sync")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cron_runs_a_pass_and_reports_counts() {
        let runtime = runtime(Some("s3cret"));
        connected_user(&runtime).await;

        let resp = app(AppState::new(runtime))
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/cron/sync")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["synced"], 1);
        assert_eq!(body["failed"], 0);
        assert_eq!(body["skipped"], 0);
    }

    #[tokio::test]
    async fn unknown_user_integration_is_not_found() {
        let resp = app(AppState::new(runtime(None)))
            .oneshot(request(
                "GET",
                &format!("/api/users/{}/integration", Uuid::new_v4()),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_sync_then_status_view() {
        let runtime = runtime(None);
        let user_id = connected_user(&runtime).await;
        let router = app(AppState::new(runtime));

        let synced = router
            .clone()
            .oneshot(request("POST", &format!("/api/users/{user_id}/integration/sync")))
            .await
            .unwrap();
        assert_eq!(synced.status(), StatusCode::OK);
        let outcome = json_body(synced).await;
        assert_eq!(outcome["success"], true);
        assert_eq!(outcome["imported"], 3);

        let status = router
            .oneshot(request("GET", &format!("/api/users/{user_id}/integration")))
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        let view = json_body(status).await;
        assert_eq!(view["external_handle"], "reader");
        assert_eq!(view["sync_enabled"], true);
        assert_eq!(view["last_status"]["status"], "success");
    }

    #[tokio::test]
    async fn toggle_retry_and_disconnect() {
        let runtime = runtime(None);
        let user_id = connected_user(&runtime).await;
        let router = app(AppState::new(runtime.clone()));

        let toggled = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri(format!("/api/users/{user_id}/integration/enabled"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"enabled":false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(toggled.status(), StatusCode::OK);
        let view = runtime.integrations.status(user_id).await.unwrap().unwrap();
        assert!(!view.sync_enabled);

        let retried = router
            .clone()
            .oneshot(request("POST", &format!("/api/users/{user_id}/integration/retry")))
            .await
            .unwrap();
        assert_eq!(retried.status(), StatusCode::OK);
        let view = runtime.integrations.status(user_id).await.unwrap().unwrap();
        assert!(view.sync_enabled);

        let removed = router
            .clone()
            .oneshot(request("DELETE", &format!("/api/users/{user_id}/integration")))
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::OK);

        let again = router
            .oneshot(request("DELETE", &format!("/api/users/{user_id}/integration")))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }
}
