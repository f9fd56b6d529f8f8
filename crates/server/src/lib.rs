//! HTTP/JSON binding of the change-control plane.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Extension, Query},
    http::{header::CONTENT_TYPE, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use vibe_common::{ChatMessage, Permissions, PlanningOracle};
use vibe_core::{
    engine::PatchOptions,
    events::EventKind,
    gateway::{ActionGateway, ClientState, TurnRequest},
    ChangeControl, Side, TestRun, VibeError, VibeResult,
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    control: Arc<ChangeControl>,
    gateway: ActionGateway,
}

impl AppState {
    pub fn new(control: Arc<ChangeControl>, oracle: Arc<dyn PlanningOracle>) -> Self {
        let gateway = ActionGateway::new(oracle, Arc::clone(&control));
        Self {
            inner: Arc::new(AppStateInner { control, gateway }),
        }
    }

    fn control(&self) -> Arc<ChangeControl> {
        Arc::clone(&self.inner.control)
    }

    fn gateway(&self) -> &ActionGateway {
        &self.inner.gateway
    }
}

#[derive(Debug)]
enum ApiError {
    Vibe(VibeError),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<VibeError> for ApiError {
    fn from(err: VibeError) -> Self {
        ApiError::Vibe(err)
    }
}

fn status_for(err: &VibeError) -> StatusCode {
    match err {
        VibeError::InvalidDiff { .. } | VibeError::Validation { .. } => StatusCode::BAD_REQUEST,
        VibeError::ProtectedPath { .. } => StatusCode::FORBIDDEN,
        VibeError::NotFound { .. } => StatusCode::NOT_FOUND,
        VibeError::ResourceLimit { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        VibeError::Busy { .. } => StatusCode::LOCKED,
        VibeError::Io { .. } | VibeError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Vibe(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!("request failed: {err}");
                }
                let mut body = json!({ "error": err.to_string(), "code": err.error_code() });
                if let Some(hint) = err.recovery_hint() {
                    body["hint"] = Value::from(hint);
                }
                (status, Json(body)).into_response()
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!("HTTP handler error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs a filesystem-bound operation off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> VibeResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/config", get(config))
        .route("/api/debug", get(debug_log))
        .route("/api/tree", get(tree))
        .route("/api/file", get(file))
        .route("/api/search", get(search))
        .route("/api/patch/diff", post(patch_diff))
        .route("/api/patch", post(patch_ops))
        .route("/api/diff", post(diff_preview))
        .route("/api/revert/check", post(revert_check))
        .route("/api/revert", post(revert))
        .route("/api/snapshots", get(snapshots))
        .route("/api/snapshots/prune", post(prune_snapshots))
        .route("/api/events", get(events).post(append_event))
        .route("/api/test-result", post(test_result))
        .route("/api/agent/chat", post(agent_chat))
        .layer(Extension(state))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .allow_origin(Any)
}

pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {addr}"))?;
    tracing::info!("vibe server listening on http://{addr}");

    axum::serve(listener, build_router(state))
        .await
        .context("HTTP server encountered an unrecoverable error")
}

async fn ping(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "root": state.inner.control.workspace().root().display().to_string(),
        "provider": state.gateway().provider(),
    }))
}

async fn config(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let control = &state.inner.control;
    let config = control.config();
    Json(json!({
        "perms": config.permissions,
        "root": control.workspace().root().display().to_string(),
        "stateDir": config.workspace.state_dir,
        "limits": config.limits,
        "patch": config.patch,
        "git": {
            "integration": config.git.integration,
            "available": control.vcs().is_available(),
            "branch": control.vcs().current_branch(),
        },
        "oracle": {
            "provider": state.gateway().provider(),
            "model": config.oracle.model,
        },
    }))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn debug_log(
    Extension(state): Extension<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(json!({ "entries": state.gateway().debug_log().recent(query.limit) }))
}

#[derive(Debug, Deserialize)]
struct TreeQuery {
    path: Option<String>,
    depth: Option<u64>,
}

async fn tree(
    Extension(state): Extension<AppState>,
    Query(query): Query<TreeQuery>,
) -> ApiResult<Json<Value>> {
    let control = state.control();
    let label = query.path.clone().unwrap_or_else(|| ".".to_string());
    let entries = blocking(move || control.tree(query.path.as_deref(), query.depth)).await?;
    Ok(Json(json!({ "root": label, "entries": entries })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileQuery {
    path: Option<String>,
    offset: Option<u64>,
    max_bytes: Option<u64>,
}

async fn file(
    Extension(state): Extension<AppState>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<Value>> {
    let path = query
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("path required".to_string()))?;
    let control = state.control();
    let read = blocking(move || control.read_file(&path, query.offset.unwrap_or(0), query.max_bytes))
        .await?;
    Ok(Json(json!(read)))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    path: Option<String>,
    max: Option<u64>,
    ext: Option<String>,
}

async fn search(
    Extension(state): Extension<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let needle = query
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("q required".to_string()))?;
    let control = state.control();
    let matches = blocking(move || {
        control.search(&needle, query.path.as_deref(), query.max, query.ext.as_deref())
    })
    .await?;
    Ok(Json(json!({ "matches": matches })))
}

#[derive(Debug, Deserialize)]
struct PatchDiffBody {
    #[serde(default)]
    diff: String,
    #[serde(flatten)]
    options: PatchOptions,
}

async fn patch_diff(
    Extension(state): Extension<AppState>,
    Json(body): Json<PatchDiffBody>,
) -> ApiResult<Json<Value>> {
    if body.diff.trim().is_empty() {
        return Err(ApiError::BadRequest("diff required".to_string()));
    }
    let control = state.control();
    let result = blocking(move || control.apply_patch(&body.diff, body.options)).await?;
    Ok(Json(json!(result)))
}

#[derive(Debug, Default, Deserialize)]
struct OpsMeta {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpsBody {
    #[serde(default)]
    ops: Vec<Value>,
    #[serde(default)]
    meta: OpsMeta,
}

async fn patch_ops(
    Extension(state): Extension<AppState>,
    Json(body): Json<OpsBody>,
) -> ApiResult<Json<Value>> {
    let control = state.control();
    let result = blocking(move || control.apply_ops(&body.ops, body.meta.title.as_deref())).await?;
    Ok(Json(json!(result)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiffBody {
    #[serde(default)]
    path: String,
    #[serde(default)]
    new_content: String,
}

async fn diff_preview(
    Extension(state): Extension<AppState>,
    Json(body): Json<DiffBody>,
) -> ApiResult<Json<Value>> {
    if body.path.trim().is_empty() {
        return Err(ApiError::BadRequest("path required".to_string()));
    }
    let control = state.control();
    let diff = blocking(move || control.diff_against_current(&body.path, &body.new_content)).await?;
    Ok(Json(json!({ "diff": diff })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevertBody {
    #[serde(default)]
    changeset_id: String,
    direction: Option<Side>,
    paths: Option<Vec<String>>,
}

impl RevertBody {
    fn id(&self) -> ApiResult<String> {
        let id = self.changeset_id.trim();
        if id.is_empty() {
            return Err(ApiError::BadRequest("changesetId required".to_string()));
        }
        Ok(id.to_string())
    }
}

async fn revert_check(
    Extension(state): Extension<AppState>,
    Json(body): Json<RevertBody>,
) -> ApiResult<Json<Value>> {
    let id = body.id()?;
    let direction = body.direction.unwrap_or(Side::Before);
    let control = state.control();
    let warnings =
        blocking(move || control.check_revert(&id, direction, body.paths.as_deref())).await?;
    Ok(Json(json!({ "ok": warnings.is_empty(), "warnings": warnings })))
}

async fn revert(
    Extension(state): Extension<AppState>,
    Json(body): Json<RevertBody>,
) -> ApiResult<Json<Value>> {
    let id = body.id()?;
    let direction = body.direction.unwrap_or(Side::Before);
    let control = state.control();
    let result = blocking(move || control.revert(&id, direction, body.paths.as_deref())).await?;
    Ok(Json(json!(result)))
}

async fn snapshots(Extension(state): Extension<AppState>) -> ApiResult<Json<Value>> {
    let control = state.control();
    let snapshots = blocking(move || control.list_snapshots()).await?;
    Ok(Json(json!({ "snapshots": snapshots })))
}

#[derive(Debug, Deserialize)]
struct PruneBody {
    keep: Option<usize>,
}

async fn prune_snapshots(
    Extension(state): Extension<AppState>,
    Json(body): Json<PruneBody>,
) -> ApiResult<Json<Value>> {
    let keep = body
        .keep
        .ok_or_else(|| ApiError::BadRequest("keep required".to_string()))?;
    let control = state.control();
    let report = blocking(move || control.prune_snapshots(keep)).await?;
    Ok(Json(json!(report)))
}

async fn events(
    Extension(state): Extension<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let control = state.control();
    let (events, summary) =
        blocking(move || Ok((control.read_events(query.limit), control.memory_summary()))).await?;
    Ok(Json(json!({ "events": events, "summary": summary })))
}

#[derive(Debug, Deserialize)]
struct EventBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Value,
}

async fn append_event(
    Extension(state): Extension<AppState>,
    Json(body): Json<EventBody>,
) -> ApiResult<Json<Value>> {
    let kind = body
        .kind
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::BadRequest("type required".to_string()))?;
    let control = state.control();
    let event = blocking(move || control.append_event(EventKind::from(kind), body.data)).await?;
    Ok(Json(json!({ "ok": true, "event": event })))
}

async fn test_result(
    Extension(state): Extension<AppState>,
    Json(run): Json<TestRun>,
) -> ApiResult<Json<Value>> {
    let control = state.control();
    let event = blocking(move || control.record_test_result(run)).await?;
    Ok(Json(json!({ "ok": true, "event": event })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatClient {
    #[serde(flatten)]
    state: ClientState,
    perms: Option<Permissions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatBody {
    text: String,
    history: Vec<ChatMessage>,
    client: ChatClient,
}

async fn agent_chat(
    Extension(state): Extension<AppState>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Json<Value>> {
    let text = body.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::BadRequest("text required".to_string()));
    }
    let permissions = body
        .client
        .perms
        .unwrap_or(state.inner.control.config().permissions);
    let turn = state
        .gateway()
        .resolve(TurnRequest {
            text,
            history: body.history,
            client: body.client.state,
            permissions,
        })
        .await;
    Ok(Json(json!(turn)))
}
