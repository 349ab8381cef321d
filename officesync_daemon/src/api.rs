//! HTTP query surface: backups, metrics history, events and live status.
//! Every read that finds nothing answers 404 `{"error": "no data available"}`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::backup::BackupKind;
use crate::error::{BackupError, StoreError};
use crate::sampler::status_report;
use crate::state::AppState;

const DEFAULT_HOURS: u32 = 24;
const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn no_data() -> Self {
        Self::new(StatusCode::NOT_FOUND, "no data available")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        let status = match &e {
            BackupError::NotFound(_) | BackupError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            BackupError::InvalidAgentId(_) => StatusCode::BAD_REQUEST,
            BackupError::AgentNotInBackup { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BackupError::ChecksumMismatch { .. } | BackupError::ArchiveMissing { .. } => {
                StatusCode::CONFLICT
            }
            _ => {
                error!("backup operation failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!("metrics query failed: {e}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/backups", get(list_backups).post(create_backup))
        .route("/api/backups/procedures", get(procedures))
        .route("/api/backups/:id", get(get_backup))
        .route("/api/backups/:id/verify", get(verify_backup))
        .route("/api/backups/:id/restore", post(restore_backup))
        .route("/api/agents/:id/metrics", get(agent_metrics))
        .route("/api/agents/:id/summary", get(agent_summary))
        .route("/api/metrics/current", get(current_metrics))
        .route("/api/system/metrics", get(system_metrics))
        .route("/api/system/events", get(system_events))
        .route("/api/websocket/status", get(websocket_status))
        .route("/api/status", get(status))
        .with_state(state)
}

// ----- backups -----

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn list_backups(State(app): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult {
    let kind = q
        .kind
        .as_deref()
        .map(str::parse::<BackupKind>)
        .transpose()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    let backups = app.backups.list_backups(kind);
    Ok(Json(json!({ "count": backups.len(), "backups": backups })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    agent_id: Option<String>,
}

async fn create_backup(
    State(app): State<AppState>,
    body: Option<Json<CreateBody>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let rec = match body.agent_id.as_deref() {
        Some(agent) => app.backups.create_agent_state_backup(agent).await?,
        None => app.backups.create_full_backup().await?,
    };
    info!("backup {} created on request", rec.id);
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "backup": rec }))))
}

async fn procedures(State(app): State<AppState>) -> Json<Value> {
    Json(app.backups.recovery_procedures())
}

async fn get_backup(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let rec = app
        .backups
        .get_backup(&id)
        .ok_or_else(|| ApiError::from(BackupError::NotFound(id)))?;
    Ok(Json(json!(rec)))
}

async fn verify_backup(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let valid = app.backups.verify_backup(&id).await?;
    if !valid {
        app.broadcaster.broadcast_notification(
            "Backup verification failed",
            &format!("{id} does not match its checksum"),
            "error",
            Some(json!({ "id": id })),
        );
    }
    Ok(Json(json!({ "id": id, "valid": valid })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreBody {
    agent_id: Option<String>,
}

async fn restore_backup(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RestoreBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = match body.agent_id.as_deref() {
        Some(agent) => app.backups.restore_agent_state(&id, agent).await?,
        None => app.backups.restore_backup(&id, None).await?,
    };
    app.broadcaster.broadcast_notification(
        "Backup restored",
        &format!("{id} restored ({} files)", outcome.files),
        "warning",
        Some(json!({ "id": id })),
    );
    Ok(Json(json!({ "success": true, "restore": outcome })))
}

// ----- metrics -----

#[derive(Debug, Deserialize)]
struct HoursQuery {
    hours: Option<u32>,
}

async fn agent_metrics(
    State(app): State<AppState>,
    Path(agent): Path<String>,
    Query(q): Query<HoursQuery>,
) -> ApiResult {
    let hours = q.hours.unwrap_or(DEFAULT_HOURS);
    let samples = app.pipeline.history(&agent, hours).await?;
    if samples.is_empty() {
        return Err(ApiError::no_data());
    }
    Ok(Json(json!({
        "agentId": agent,
        "hours": hours,
        "count": samples.len(),
        "samples": samples,
    })))
}

async fn agent_summary(State(app): State<AppState>, Path(agent): Path<String>) -> ApiResult {
    match app.pipeline.performance_summary(&agent).await? {
        Some(summary) => Ok(Json(json!(summary))),
        None => Err(ApiError::no_data()),
    }
}

async fn current_metrics(State(app): State<AppState>) -> Json<Value> {
    Json(json!(app.pipeline.current_metrics()))
}

async fn system_metrics(State(app): State<AppState>, Query(q): Query<HoursQuery>) -> ApiResult {
    let hours = q.hours.unwrap_or(DEFAULT_HOURS);
    let samples = app.pipeline.system_history(hours).await?;
    if samples.is_empty() {
        return Err(ApiError::no_data());
    }
    Ok(Json(json!({ "hours": hours, "count": samples.len(), "samples": samples })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<usize>,
}

async fn system_events(State(app): State<AppState>, Query(q): Query<EventsQuery>) -> ApiResult {
    let limit = q.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let events = app.pipeline.recent_events(q.kind.as_deref(), limit).await?;
    if events.is_empty() {
        return Err(ApiError::no_data());
    }
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

// ----- live status -----

async fn websocket_status(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "connectedClients": app.broadcaster.client_count(),
        "agentsTracked": app.broadcaster.agent_count(),
    }))
}

async fn status(State(app): State<AppState>) -> Json<Value> {
    let report = status_report(&app);
    let uptime = (chrono::Utc::now() - app.started_at).num_seconds();
    Json(json!({
        "status": report,
        "startedAt": app.started_at,
        "uptimeSeconds": uptime,
        "collectIntervalSecs": app.pipeline.interval().as_secs(),
        "backupConsistency": app.backups.consistency_report(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    use crate::backup::BackupManager;
    use crate::broadcaster::Broadcaster;
    use crate::config::StatePaths;
    use crate::metrics::MetricsPipeline;
    use crate::store::MetricsStore;

    async fn app() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        std::fs::create_dir_all(paths.agent_dir("scout")).unwrap();
        std::fs::write(
            paths.agent_state("scout"),
            r#"{"status":"active","tasksCompleted":10,"tasksFailed":2}"#,
        )
        .unwrap();
        let store = MetricsStore::open_in_memory().await.unwrap();
        let pipeline = Arc::new(MetricsPipeline::new(
            paths.clone(),
            store,
            Duration::from_secs(60),
        ));
        let backups = BackupManager::open(paths.clone(), chrono::Duration::days(7))
            .await
            .unwrap()
            .with_event_log(pipeline.clone());
        let state = AppState::new(
            Broadcaster::new(paths.clone()),
            pipeline,
            Arc::new(backups),
            paths,
        );
        (dir, state)
    }

    async fn call(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = router(state.clone())
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn empty_reads_say_no_data() {
        let (_dir, state) = app().await;
        for uri in [
            "/api/agents/scout/metrics",
            "/api/agents/scout/summary",
            "/api/system/metrics?hours=1",
            "/api/system/events",
        ] {
            let (status, body) = call(&state, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body, json!({"error": "no data available"}));
        }
    }

    #[tokio::test]
    async fn metrics_after_collection() {
        let (_dir, state) = app().await;
        state.pipeline.collect().await.unwrap();

        let (status, body) = call(&state, Method::GET, "/api/agents/scout/metrics?hours=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["samples"][0]["agentId"], "scout");

        let (status, body) = call(&state, Method::GET, "/api/agents/scout/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dataPoints"], 1);

        let (status, body) = call(&state, Method::GET, "/api/system/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["samples"][0]["activeAgents"], 1);
    }

    #[tokio::test]
    async fn backup_create_list_verify_restore() {
        let (_dir, state) = app().await;
        let (status, body) = call(&state, Method::POST, "/api/backups", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["backup"]["id"].as_str().unwrap().to_string();

        let (_, list) = call(&state, Method::GET, "/api/backups?type=full", None).await;
        assert_eq!(list["count"], 1);
        let (_, list) = call(&state, Method::GET, "/api/backups?type=agentState", None).await;
        assert_eq!(list["count"], 0);
        let (status, _) = call(&state, Method::GET, "/api/backups?type=weekly", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, verify) = call(&state, Method::GET, &format!("/api/backups/{id}/verify"), None).await;
        assert_eq!(verify["valid"], true);

        let (status, restored) = call(
            &state,
            Method::POST,
            &format!("/api/backups/{id}/restore"),
            Some(json!({"agentId": "scout"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(restored["success"], true);

        let (status, _) = call(&state, Method::GET, "/api/backups/missing/verify", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = call(
            &state,
            Method::POST,
            &format!("/api/backups/{id}/restore"),
            Some(json!({"agentId": "forge"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("forge"));
    }

    #[tokio::test]
    async fn agent_ids_outside_the_agents_dir_are_bad_requests() {
        let (_dir, state) = app().await;
        let (status, body) = call(&state, Method::POST, "/api/backups", Some(json!({"agentId": ".."}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid agent id"));

        let (_, full) = call(&state, Method::POST, "/api/backups", None).await;
        let id = full["backup"]["id"].as_str().unwrap().to_string();
        let (status, _) = call(
            &state,
            Method::POST,
            &format!("/api/backups/{id}/restore"),
            Some(json!({"agentId": "../backups"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, list) = call(&state, Method::GET, "/api/backups", None).await;
        assert_eq!(list["count"], 1);
    }

    #[tokio::test]
    async fn status_endpoints() {
        let (_dir, state) = app().await;
        let (_, ws) = call(&state, Method::GET, "/api/websocket/status", None).await;
        assert_eq!(ws["connectedClients"], 0);

        let (status, body) = call(&state, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["backupsAvailable"], 0);

        let (_, procs) = call(&state, Method::GET, "/api/backups/procedures", None).await;
        assert_eq!(procs["procedures"].as_array().unwrap().len(), 3);
    }
}
