//! JSON surface over the store, the query layer and the sync service. Serves
//! the single-operator scope.
use crate::config::Listener as ListenerConfig;
use crate::record::{RecordKind, TrafficRecord};
use crate::scheduler::SyncService;
use crate::store::{Snapshot, StorageError, TrafficStore};
use crate::summary::{OverallTotals, Stats};
use crate::sync::{SyncError, SyncReport};
use crate::types::{OwnerKind, RepositorySummary, TrackedRepository};
use crate::badge;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

const DEFAULT_HISTORY_DAYS: usize = 30;
// Multi-year backups of many repositories are well past axum's 2 MB default.
const IMPORT_BODY_LIMIT: usize = 64 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TrafficStore>,
    pub stats: Stats,
    pub sync: SyncService,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/stats", get(all_stats))
        .route("/api/stats/repo", get(repo_stats))
        .route("/api/history", get(history))
        .route(
            "/api/repos",
            get(list_repos).post(track_repo).delete(untrack_repo),
        )
        .route("/api/sync", post(sync_now))
        .route("/api/export", get(export))
        .route(
            "/api/import",
            post(import).layer(DefaultBodyLimit::max(IMPORT_BODY_LIMIT)),
        )
        .route("/badge/{repo}/total.svg", get(clones_badge))
        .with_state(state)
}

pub async fn serve<F>(
    listener: &ListenerConfig,
    state: AppState,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "serving api");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Storage(StorageError::InvalidData(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Sync(SyncError::Configuration(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Sync(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Failed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(ActionResponse {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Serialize)]
struct StatsResponse {
    window_days: u32,
    overall: OverallTotals,
    repositories: Vec<RepositorySummary>,
    last_sync: Option<SyncReport>,
}

#[derive(Serialize)]
struct SyncResponse {
    success: bool,
    message: String,
    report: SyncReport,
}

#[derive(Deserialize, Debug)]
struct RepoParams {
    repo: String,
}

#[derive(Deserialize, Debug)]
struct HistoryParams {
    repo: String,
    #[serde(default)]
    kind: Option<RecordKind>,
    #[serde(default)]
    days: Option<usize>,
}

#[derive(Deserialize, Debug)]
struct TrackRequest {
    repo: String,
    #[serde(default)]
    owner_type: OwnerKind,
}

#[derive(Deserialize, Debug)]
struct ImportParams {
    #[serde(default)]
    replace: bool,
}

fn repository_id(repo: &str) -> Result<&str, ApiError> {
    let repo = repo.trim();
    if repo.is_empty() {
        return Err(ApiError::BadRequest("repository name is required".into()));
    }
    Ok(repo)
}

async fn health() -> &'static str {
    "ok\n"
}

async fn ready(State(state): State<AppState>) -> Response {
    if state.sync.is_running() {
        "ok\n".into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready\n").into_response()
    }
}

async fn all_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let repositories = state.stats.summarize_all(None).await?;
    Ok(Json(StatsResponse {
        window_days: state.stats.window_days(),
        overall: OverallTotals::from_summaries(&repositories),
        repositories,
        last_sync: state.sync.last_report(),
    }))
}

async fn repo_stats(
    State(state): State<AppState>,
    Query(params): Query<RepoParams>,
) -> Result<Json<RepositorySummary>, ApiError> {
    let repo = repository_id(&params.repo)?;
    Ok(Json(state.stats.summarize(repo, None).await?))
}

async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<TrafficRecord>>, ApiError> {
    let repo = repository_id(&params.repo)?;
    let records = state
        .stats
        .history(
            repo,
            params.kind.unwrap_or(RecordKind::Clone),
            params.days.unwrap_or(DEFAULT_HISTORY_DAYS),
        )
        .await?;
    Ok(Json(records))
}

async fn list_repos(
    State(state): State<AppState>,
) -> Result<Json<Vec<TrackedRepository>>, ApiError> {
    Ok(Json(state.store.list_active_repositories(None).await?))
}

async fn track_repo(
    State(state): State<AppState>,
    Json(request): Json<TrackRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let repo = repository_id(&request.repo)?;
    if state
        .store
        .track_repository(repo, request.owner_type, None)
        .await
    {
        Ok(ActionResponse::ok(format!("now tracking {repo}")))
    } else {
        Err(ApiError::Failed(format!("could not track {repo}")))
    }
}

async fn untrack_repo(
    State(state): State<AppState>,
    Query(params): Query<RepoParams>,
) -> Result<Json<ActionResponse>, ApiError> {
    let repo = repository_id(&params.repo)?;
    if state.store.untrack_repository(repo, None).await {
        Ok(ActionResponse::ok(format!("stopped tracking {repo}")))
    } else {
        Err(ApiError::Failed(format!("could not untrack {repo}")))
    }
}

async fn sync_now(State(state): State<AppState>) -> Result<Json<SyncResponse>, ApiError> {
    let report = state.sync.refresh(None).await?;
    Ok(Json(SyncResponse {
        success: true,
        message: report.message(),
        report,
    }))
}

async fn clones_badge(
    State(state): State<AppState>,
    Path(repo): Path<String>,
) -> Result<Response, ApiError> {
    let repo = repository_id(&repo)?;
    let summary = state.stats.summarize(repo, None).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        badge::total_clones(summary.clones.count),
    )
        .into_response())
}

async fn export(State(state): State<AppState>) -> Result<Json<Snapshot>, ApiError> {
    Ok(Json(state.store.export_all().await?))
}

async fn import(
    State(state): State<AppState>,
    Query(params): Query<ImportParams>,
    Json(snapshot): Json<Snapshot>,
) -> Result<Json<ActionResponse>, ApiError> {
    if state.store.import_all(&snapshot, params.replace).await {
        Ok(ActionResponse::ok(format!(
            "imported {} clone and {} view records",
            snapshot.clone_history.len(),
            snapshot.view_history.len()
        )))
    } else {
        Err(ApiError::Failed("import failed, store left unchanged".into()))
    }
}
