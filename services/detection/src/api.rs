use crate::config::ApiConfig;
use crate::detection::PredictFireResponse;
use crate::error::{DetectionError, PipelineFailure};
use crate::log_store::{DetectionLogResponse, LogQuery, LogStore};
use crate::pipeline::{DetectionPipeline, Upload};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Multipart field carrying the uploaded image
pub const UPLOAD_FIELD: &str = "file";

const MAX_LOG_LIMIT: i64 = 500;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DetectionPipeline>,
    pub log_store: Arc<LogStore>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

fn error_response(status: StatusCode, detail: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            detail: detail.to_string(),
        }),
    )
}

impl IntoResponse for PipelineFailure {
    fn into_response(self) -> Response {
        let status = match self.error {
            DetectionError::UnsupportedFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.client_detail()).into_response()
    }
}

/// Query parameters for the log list
#[derive(Debug, Deserialize)]
pub struct LogListQuery {
    /// Filter by fire flag
    pub has_fire: Option<bool>,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset for pagination
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Log list response
#[derive(Debug, Serialize)]
pub struct LogListResponse {
    pub logs: Vec<DetectionLogResponse>,
    pub total_count: i64,
    pub has_more: bool,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let artifacts = ServeDir::new(state.pipeline.artifacts().dir());

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/predict_fire", post(predict_fire))
        .route("/detection_logs", get(list_logs))
        .route("/detection_logs/:log_id", get(get_log))
        .nest_service("/log", artifacts)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "fire-detection-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.log_store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": format!("{:#}", e)
            })),
        ),
    }
}

/// Run fire detection on one uploaded image
#[instrument(skip(state, multipart))]
async fn predict_fire(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<PredictFireResponse>, Response> {
    let mut upload = None;

    loop {
        let field = multipart.next_field().await.map_err(|e| {
            warn!(error = %e, "Failed to read multipart body");
            error_response(e.status(), "failed to read upload.").into_response()
        })?;
        let Some(field) = field else { break };

        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(|e| {
            warn!(error = %e, "Failed to read upload field");
            error_response(e.status(), "failed to read upload.").into_response()
        })?;
        upload = Some(Upload::new(file_name, data));
        break;
    }

    let upload = upload.ok_or_else(|| {
        error_response(StatusCode::UNPROCESSABLE_ENTITY, "file field is required.").into_response()
    })?;

    let outcome = state
        .pipeline
        .run(upload)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok(Json(PredictFireResponse::from(&outcome)))
}

/// List detection logs with filtering
#[instrument(skip(state))]
async fn list_logs(
    State(state): State<AppState>,
    Query(params): Query<LogListQuery>,
) -> Result<Json<LogListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let limit = params.limit.clamp(0, MAX_LOG_LIMIT);
    let query = LogQuery {
        has_fire: params.has_fire,
        limit: limit + 1, // Fetch one extra to check has_more
        offset: params.offset.max(0),
    };

    let mut logs = state.log_store.list(&query).await.map_err(|e| {
        error!(error = %e, "Failed to query detection logs");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to query detection logs.",
        )
    })?;

    let has_more = logs.len() > limit as usize;
    if has_more {
        logs.pop();
    }

    let total_count = state
        .log_store
        .count(params.has_fire)
        .await
        .unwrap_or(0);

    Ok(Json(LogListResponse {
        logs: logs.into_iter().map(Into::into).collect(),
        total_count,
        has_more,
    }))
}

/// Get a single detection log
#[instrument(skip(state))]
async fn get_log(
    State(state): State<AppState>,
    Path(log_id): Path<i64>,
) -> Result<Json<DetectionLogResponse>, (StatusCode, Json<ErrorResponse>)> {
    let log = state.log_store.get(log_id).await.map_err(|e| {
        error!(error = %e, "Failed to get detection log");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to query detection logs.",
        )
    })?;

    match log {
        Some(log) => Ok(Json(log.into())),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            "detection log not found.",
        )),
    }
}

/// Start the detection API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting detection API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::tests::StubEngine;
    use crate::log_store::tests::memory_store;
    use crate::log_store::{DetectionLogWriter, MockDetectionLogWriter};
    use crate::pipeline::tests::{fire_engine, harness, png_bytes, safe_engine, Harness};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "detection-test-boundary";

    struct TestApp {
        router: Router,
        store: Arc<LogStore>,
        // keeps the staging and artifact directories alive
        dir: tempfile::TempDir,
    }

    async fn app_with(engine: StubEngine, writer: Option<Arc<dyn DetectionLogWriter>>) -> TestApp {
        app_with_timeout(engine, writer, Duration::from_secs(5)).await
    }

    async fn app_with_timeout(
        engine: StubEngine,
        writer: Option<Arc<dyn DetectionLogWriter>>,
        timeout: Duration,
    ) -> TestApp {
        let store = Arc::new(memory_store().await);
        let writer = writer.unwrap_or_else(|| store.clone());
        let Harness { dir, pipeline } = harness(engine, writer, timeout);

        let state = AppState {
            pipeline,
            log_store: store.clone(),
        };
        let router = create_router(state, &ApiConfig::default());

        TestApp { router, store, dir }
    }

    fn multipart_request(field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"{f}\"; filename=\"{n}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                b = BOUNDARY,
                f = field,
                n = file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict_fire")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(router, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn staged_count(app: &TestApp) -> usize {
        std::fs::read_dir(app.dir.path().join("temp"))
            .map(|d| d.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_predict_safe() {
        let app = app_with(safe_engine(), None).await;

        let (status, body) = send_json(
            &app.router,
            multipart_request("file", "hallway.jpg", &png_bytes(16, 16)),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "safe");
        assert!(body["file_name"].is_null());
        assert!(body["result_image"].is_null());
        assert_eq!(body["detections"].as_array().unwrap().len(), 1);
        assert_eq!(body["date"].as_str().unwrap().len(), 19);

        assert_eq!(app.store.count(Some(false)).await.unwrap(), 1);
        assert_eq!(staged_count(&app), 0);
    }

    #[tokio::test]
    async fn test_predict_fire_artifact_is_served() {
        let app = app_with(fire_engine(), None).await;

        let (status, body) = send_json(
            &app.router,
            multipart_request("file", "kitchen.png", &png_bytes(32, 32)),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "fire detected");
        assert_eq!(body["file_name"], "kitchen.png");
        let artifact = body["result_image"].as_str().unwrap().to_string();
        assert!(artifact.ends_with(".png"));

        let (status, bytes) = send(&app.router, get(&format!("/log/{}", artifact))).await;
        assert_eq!(status, StatusCode::OK);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 32);

        let logs = app.store.list(&LogQuery::default()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].has_fire);
    }

    #[tokio::test]
    async fn test_predict_unsupported_format() {
        let app = app_with(fire_engine(), None).await;

        let (status, body) = send_json(
            &app.router,
            multipart_request("file", "doc.pdf", b"%PDF-1.4"),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            body["detail"],
            "unsupported file format. only jpg, jpeg or png are allowed."
        );
        assert_eq!(staged_count(&app), 0);
        assert_eq!(app.store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_predict_missing_file_field() {
        let app = app_with(fire_engine(), None).await;

        let (status, body) = send_json(
            &app.router,
            multipart_request("image", "kitchen.png", &png_bytes(8, 8)),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["detail"], "file field is required.");
    }

    #[tokio::test]
    async fn test_predict_log_failure_is_generic_500() {
        let mut writer = MockDetectionLogWriter::new();
        writer
            .expect_write()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("no such table: detection_logs")));
        let app = app_with(fire_engine(), Some(Arc::new(writer))).await;

        let (status, body) = send_json(
            &app.router,
            multipart_request("file", "kitchen.png", &png_bytes(8, 8)),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "failed to process image.");
        let artifacts = std::fs::read_dir(app.dir.path().join("log"))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(artifacts, 0);
    }

    #[tokio::test]
    async fn test_predict_slow_engine_times_out() {
        let mut engine = fire_engine();
        engine.delay = Some(Duration::from_millis(500));
        let app = app_with_timeout(engine, None, Duration::from_millis(50)).await;

        let (status, body) = send_json(
            &app.router,
            multipart_request("file", "kitchen.png", &png_bytes(8, 8)),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "failed to process image.");
        assert_eq!(app.store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_and_get_logs() {
        let app = app_with(fire_engine(), None).await;
        for name in ["a.png", "b.png", "c.png"] {
            let (status, _) =
                send(&app.router, multipart_request("file", name, &png_bytes(8, 8))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = send_json(&app.router, get("/detection_logs?limit=2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logs"].as_array().unwrap().len(), 2);
        assert_eq!(body["total_count"], 3);
        assert_eq!(body["has_more"], true);

        let (_, body) = send_json(&app.router, get("/detection_logs?has_fire=false")).await;
        assert_eq!(body["total_count"], 0);
        assert_eq!(body["has_more"], false);

        let id = app.store.list(&LogQuery::default()).await.unwrap()[0].id;
        let (status, body) = send_json(&app.router, get(&format!("/detection_logs/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id);
        assert_eq!(body["has_fire"], true);
    }

    #[tokio::test]
    async fn test_get_missing_log() {
        let app = app_with(safe_engine(), None).await;

        let (status, body) = send_json(&app.router, get("/detection_logs/999")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "detection log not found.");
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let app = app_with(safe_engine(), None).await;

        let (status, body) = send_json(&app.router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = send_json(&app.router, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "connected");

        app.store.pool().close().await;
        let (status, body) = send_json(&app.router, get("/ready")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["database"], "disconnected");
    }

    #[test]
    fn test_failure_status_mapping() {
        let rejected = PipelineFailure::new(
            crate::error::Stage::Validate,
            DetectionError::UnsupportedFormat("doc.pdf".to_string()),
        )
        .into_response();
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let failed = PipelineFailure::new(
            crate::error::Stage::Stage,
            DetectionError::StagingFailed("disk full".to_string()),
        )
        .into_response();
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
