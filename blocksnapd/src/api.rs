//! HTTP control surface.
//!
//! One POST route per control request plus status endpoints. Handlers hop
//! to the blocking pool: control operations open files, join workers and
//! take the global control mutex, none of which belongs on the runtime.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use once_cell::sync::Lazy;
use serde_json::json;

use crate::control::{
    self, ControlRequest, ReconfigureParams, ReloadParams, SetupParams, TransitionSnapParams,
};
use crate::errno::code_of;
use crate::mount::MountTable;
use crate::registry::Registry;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub struct AppState {
    pub registry: Arc<Registry>,
}

fn error_response(err: io::Error) -> Response {
    let code = code_of(&err);
    let status = match code {
        libc::ENOENT | libc::ENODEV => StatusCode::NOT_FOUND,
        libc::EBUSY => StatusCode::CONFLICT,
        libc::EFBIG => StatusCode::INSUFFICIENT_STORAGE,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": code, "message": err.to_string() }))).into_response()
}

async fn run_control(state: Arc<AppState>, request: ControlRequest) -> Response {
    let registry = Arc::clone(&state.registry);
    let result = tokio::task::spawn_blocking(move || {
        let mounts = MountTable::current().unwrap_or_default();
        control::dispatch(&registry, &mounts, request)
    })
    .await;

    match result {
        Ok(Ok(reply)) => Json(reply).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": err.to_string() })),
        )
            .into_response(),
    }
}

async fn setup_snapshot(State(state): State<Arc<AppState>>, Json(p): Json<SetupParams>) -> Response {
    run_control(state, ControlRequest::SetupSnapshot(p)).await
}

async fn reload_snapshot(State(state): State<Arc<AppState>>, Json(p): Json<ReloadParams>) -> Response {
    run_control(state, ControlRequest::ReloadSnapshot(p)).await
}

async fn reload_incremental(
    State(state): State<Arc<AppState>>,
    Json(p): Json<ReloadParams>,
) -> Response {
    run_control(state, ControlRequest::ReloadIncremental(p)).await
}

async fn destroy(State(state): State<Arc<AppState>>, Path(minor): Path<u32>) -> Response {
    run_control(state, ControlRequest::Destroy { minor }).await
}

async fn transition_to_incremental(
    State(state): State<Arc<AppState>>,
    Path(minor): Path<u32>,
) -> Response {
    run_control(state, ControlRequest::TransitionToIncremental { minor }).await
}

async fn transition_to_snapshot(
    State(state): State<Arc<AppState>>,
    Json(p): Json<TransitionSnapParams>,
) -> Response {
    run_control(state, ControlRequest::TransitionToSnapshot(p)).await
}

async fn reconfigure(
    State(state): State<Arc<AppState>>,
    Json(p): Json<ReconfigureParams>,
) -> Response {
    run_control(state, ControlRequest::Reconfigure(p)).await
}

async fn info_one(State(state): State<Arc<AppState>>, Path(minor): Path<u32>) -> Response {
    run_control(state, ControlRequest::Info { minor }).await
}

async fn info_all(State(state): State<Arc<AppState>>) -> Response {
    let registry = Arc::clone(&state.registry);
    match tokio::task::spawn_blocking(move || control::daemon_info(&registry)).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": err.to_string() })),
        )
            .into_response(),
    }
}

async fn free_minor(State(state): State<Arc<AppState>>) -> Response {
    run_control(state, ControlRequest::GetFreeMinor).await
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": START_TIME.elapsed().as_secs(),
    }))
}

pub fn all_routes(state: Arc<AppState>) -> Router {
    Lazy::force(&START_TIME);
    Router::new()
        .route("/v1/setup-snapshot", post(setup_snapshot))
        .route("/v1/reload-snapshot", post(reload_snapshot))
        .route("/v1/reload-incremental", post(reload_incremental))
        .route("/v1/destroy/{minor}", post(destroy))
        .route("/v1/transition-to-incremental/{minor}", post(transition_to_incremental))
        .route("/v1/transition-to-snapshot", post(transition_to_snapshot))
        .route("/v1/reconfigure", post(reconfigure))
        .route("/v1/info", get(info_all))
        .route("/v1/info/{minor}", get(info_one))
        .route("/v1/free-minor", get(free_minor))
        .route("/healthz", get(healthz))
        .with_state(state)
}
