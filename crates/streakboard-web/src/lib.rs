//! Axum JSON API over the report repository and the sync pipeline.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use streakboard_core::ReportRow;
use streakboard_storage::ReportRepository;
use streakboard_sync::{SyncPipeline, SyncSummary};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }

    fn repository(&self) -> &ReportRepository {
        self.pipeline.repository()
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub addr: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            addr: std::env::var("STREAKBOARD_WEB_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("STREAKBOARD_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
        }
    }
}

/// Any failure while serving a request: `500` with `{success: false, error}`.
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = format!("{:#}", self.0);
        error!(error = %message, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": message })),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct ReportsResponse {
    success: bool,
    data: Vec<ReportRow>,
    count: usize,
    from_cache: bool,
}

#[derive(Debug, Serialize)]
struct SyncInfo {
    new_records: usize,
    total_records: u64,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    success: bool,
    sync_info: SyncInfo,
    data: Vec<ReportRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/reports", get(reports_handler))
        .route("/sync", post(sync_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: &WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.addr.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, "serving report API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Streakboard weekly report API",
        "endpoints": {
            "/reports": "GET stored weekly reports, newest first",
            "/sync": "POST fetch new weekly reports from the mailbox",
        }
    }))
}

/// Stored reports; an empty store is filled by one sync first. A failing
/// sync is reported as an error rather than as an empty listing.
async fn reports_handler(State(state): State<Arc<AppState>>) -> Result<Json<ReportsResponse>, ApiError> {
    let cached = load_rows(state.repository()).await?;
    if !cached.is_empty() {
        return Ok(Json(reports_response(cached, true)));
    }

    let summary = state.pipeline.run_once().await?;
    info!(new_records = summary.new_records, "empty store filled by sync");
    let rows = load_rows(state.repository()).await?;
    Ok(Json(reports_response(rows, false)))
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Result<Json<SyncResponse>, ApiError> {
    let SyncSummary {
        new_records,
        total_records,
        ..
    } = state.pipeline.run_once().await?;
    let data = load_rows(state.repository()).await?;
    Ok(Json(SyncResponse {
        success: true,
        sync_info: SyncInfo {
            new_records,
            total_records,
        },
        data,
    }))
}

fn reports_response(data: Vec<ReportRow>, from_cache: bool) -> ReportsResponse {
    ReportsResponse {
        success: true,
        count: data.len(),
        data,
        from_cache,
    }
}

async fn load_rows(repository: &ReportRepository) -> anyhow::Result<Vec<ReportRow>> {
    let reports = repository.get_all().await?;
    Ok(reports.iter().map(ReportRow::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use streakboard_adapters::{
        BackoffPolicy, FixtureMailbox, GmailMailbox, HttpClientConfig, HttpFetcher, StaticSession,
    };
    use tower::ServiceExt;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/mailbox")
    }

    async fn fixture_state() -> AppState {
        let repo = ReportRepository::in_memory().await.unwrap();
        let mailbox = FixtureMailbox::load_dir(fixtures_dir()).unwrap();
        AppState::new(Arc::new(SyncPipeline::new(Box::new(mailbox), repo)))
    }

    async fn unreachable_state() -> AppState {
        let repo = ReportRepository::in_memory().await.unwrap();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
        })
        .unwrap();
        let mailbox = GmailMailbox::new(http, Box::new(StaticSession::new("token")))
            .with_base_url("http://127.0.0.1:9");
        AppState::new(Arc::new(SyncPipeline::new(Box::new(mailbox), repo)))
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let (status, body) = send(app(fixture_state().await), "GET", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["endpoints"]["/reports"].is_string());
        assert!(body["endpoints"]["/sync"].is_string());
    }

    #[tokio::test]
    async fn reports_on_empty_store_trigger_a_sync() {
        let app = app(fixture_state().await);
        let (status, body) = send(app.clone(), "GET", "/reports").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["from_cache"], false);
        assert_eq!(body["count"], 2);
        assert_eq!(body["data"][0]["xp"], 4022);
        assert_eq!(body["data"][0]["streak"], 55);
        assert_eq!(body["data"][1]["xp"], 3510);
        assert!(body["data"][0].get("message_id").is_none());

        let (_, cached) = send(app, "GET", "/reports").await;
        assert_eq!(cached["from_cache"], true);
        assert_eq!(cached["count"], 2);
    }

    #[tokio::test]
    async fn sync_reports_counts_and_listing() {
        let app = app(fixture_state().await);
        let (status, body) = send(app.clone(), "POST", "/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sync_info"]["new_records"], 2);
        assert_eq!(body["sync_info"]["total_records"], 2);
        assert_eq!(body["data"].as_array().map(Vec::len), Some(2));

        let (_, again) = send(app, "POST", "/sync").await;
        assert_eq!(again["sync_info"]["new_records"], 0);
        assert_eq!(again["sync_info"]["total_records"], 2);
    }

    #[tokio::test]
    async fn failed_sync_is_a_server_error() {
        let (status, body) = send(app(unreachable_state().await), "POST", "/sync").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn failed_fallback_sync_is_a_server_error() {
        let state = unreachable_state().await;
        let repository = state.repository().clone();
        let (status, body) = send(app(state), "GET", "/reports").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().is_some_and(|e| e.contains("search")));
        assert!(body.get("data").is_none());
        assert_eq!(repository.count().await.unwrap(), 0);
    }
}
