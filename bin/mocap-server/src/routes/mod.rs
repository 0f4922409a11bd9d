//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - The OpenAPI document at `/api-docs/openapi.json`
//! - Health / heartbeat route
//! - Job lifecycle routes under `/v1`

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::{middleware, Router};
use tower::ServiceBuilder;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(doc::router())
        .nest("/v1", v1::router())
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(&state)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use mocap_core::store::memory::MemoryJobStore;
    use mocap_core::{JobService, RuntimeConfig};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        _media: tempfile::TempDir,
    }

    fn app() -> TestApp {
        let media = tempfile::tempdir().unwrap();
        let runtime = RuntimeConfig {
            media_root: media.path().to_path_buf(),
            ffprobe: "/nonexistent/ffprobe".into(),
            ..RuntimeConfig::default()
        };
        let config = Config {
            bind_address: "127.0.0.1:0".into(),
            database_url: "sqlite::memory:".into(),
            log_level: "info".into(),
            log_json: false,
            log_dir: None,
            cors_allowed_origins: None,
            runtime: runtime.clone(),
        };
        let jobs = JobService::new(Arc::new(MemoryJobStore::new()), &runtime).unwrap();
        let state = Arc::new(AppState {
            config: Arc::new(config),
            jobs: Arc::new(jobs),
        });
        TestApp {
            router: build(state),
            _media: media,
        }
    }

    async fn call(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(app: &TestApp) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/v1/jobs",
            Some(json!({ "input_path": "/media/walk.mp4", "pipeline": "mediapipe" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn health_lists_pipelines() {
        let app = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["pipelines"].as_array().unwrap().iter().any(|p| p == "mediapipe"));
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api-docs/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"].get("/v1/jobs/{id}/stop").is_some());
    }

    #[tokio::test]
    async fn create_and_fetch_job() {
        let app = app();
        let id = create(&app).await;

        let (status, job) = call(&app, "GET", &format!("/v1/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "pending");
        assert_eq!(job["name"], "walk.mp4");
        assert_eq!(job["pipeline"], "mediapipe");
        assert_eq!(job["fps"], 30.0);
        assert_eq!(job["running"], false);

        let (status, view) = call(&app, "GET", &format!("/v1/jobs/{id}/status"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["progress"], 0);
        assert_eq!(view["error_summary"], "");

        let (_, list) = call(&app, "GET", "/v1/jobs", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_unknown_pipeline() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/v1/jobs",
            Some(json!({ "input_path": "/media/a.mp4", "pipeline": "kinect" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unknown pipeline 'kinect'");
    }

    #[tokio::test]
    async fn stop_pending_job_cancels_it() {
        let app = app();
        let id = create(&app).await;

        let (status, body) = call(&app, "POST", &format!("/v1/jobs/{id}/stop"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "cancelled");

        let (_, view) = call(&app, "GET", &format!("/v1/jobs/{id}/status"), None).await;
        assert_eq!(view["status"], "failed");
        assert_eq!(view["error"], "Cancelled by user");

        let (_, again) = call(&app, "POST", &format!("/v1/jobs/{id}/stop"), None).await;
        assert_eq!(again["result"], "already_finished");
    }

    #[tokio::test]
    async fn restart_of_pending_job_conflicts() {
        let app = app();
        let id = create(&app).await;
        let (status, _) = call(&app, "POST", &format!("/v1/jobs/{id}/restart"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_then_missing() {
        let app = app();
        let id = create(&app).await;

        let (status, _) = call(&app, "DELETE", &format!("/v1/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &format!("/v1/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_id_is_rejected() {
        let app = app();
        let (status, _) = call(&app, "GET", "/v1/jobs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trace_id_is_echoed() {
        let app = app();
        let trace_id = uuid::Uuid::new_v4().to_string();
        let req = Request::builder()
            .uri("/health")
            .header(trace::X_TRACE_ID, &trace_id)
            .body(Body::empty())
            .unwrap();
        let resp = app.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.headers()[trace::X_TRACE_ID], trace_id.as_str());
    }
}
