//! Control API (spec §6): axum router over the registry store, with the
//! Remote Access Gate run before every mutating handler touches the
//! registry. Grounded in the `ferrex-server` axum+tower-http shape
//! (router, JSON extractors, trace layer).

use crate::error::MonitorError;
use crate::gate::{self, GateDecision};
use crate::process::ProcessManager;
use crate::registry::RegistryStore;
use crate::types::{ProcessConfig, ProcessEntry, ProcessState, RemoteOperation};
use axum::extract::{ConnectInfo, Path as AxPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Clone)]
pub struct ApiState {
    pub registry_path: PathBuf,
    pub log_dir: PathBuf,
    pub instance_id: String,
    pub store: Arc<Mutex<RegistryStore>>,
}

impl ApiState {
    pub fn new(registry_path: PathBuf, log_dir: PathBuf, instance_id: String) -> Self {
        let store = RegistryStore::new(&registry_path, instance_id.clone());
        Self {
            registry_path,
            log_dir,
            instance_id,
            store: Arc::new(Mutex::new(store)),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/monitor/status", get(monitor_status))
        .route("/processes", get(list_processes).post(register_process))
        .route(
            "/processes/{id}",
            get(get_process).delete(deregister_process),
        )
        .route("/processes/{id}/start", post(start_process))
        .route("/processes/{id}/stop", post(stop_process))
        .route("/processes/{id}/disable", post(disable_process))
        .route("/processes/{id}/enable", post(enable_process))
        .route("/processes/{id}/autostart", put(set_autostart))
        .route("/monitor/restart", post(monitor_restart))
        .route("/config/trusted-hosts", get(get_trusted_hosts))
        .route("/config/standalone-mode", get(get_standalone_mode))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let status = match &self {
            MonitorError::ProcessNotFound(_) => StatusCode::NOT_FOUND,
            MonitorError::ProcessDisabled(_) | MonitorError::InvalidState(_) => StatusCode::CONFLICT,
            MonitorError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            MonitorError::LockTimeout | MonitorError::ExternalTimeout => StatusCode::SERVICE_UNAVAILABLE,
            MonitorError::LedgerIoError(_) | MonitorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn forbidden(reason: String) -> Response {
    (StatusCode::FORBIDDEN, Json(ErrorBody { error: reason })).into_response()
}

async fn gate_check(
    state: &ApiState,
    addr: &SocketAddr,
    op: RemoteOperation,
    executable: Option<&str>,
) -> Result<(), Response> {
    let store = state.store.lock().await;
    let config = store.registry().remote_access.clone();
    drop(store);

    match gate::evaluate(&config, &addr.ip().to_string(), op, executable) {
        GateDecision::Allow => Ok(()),
        GateDecision::Deny(reason) => {
            warn!(host = %addr.ip(), operation = ?op, reason, "remote access gate denied request");
            Err(forbidden(reason))
        }
    }
}

#[derive(Serialize)]
struct MonitorStatusBody {
    instance_id: String,
    total: usize,
    running: usize,
    stopped: usize,
    failed: usize,
    disabled: usize,
}

async fn monitor_status(State(state): State<ApiState>) -> Result<Json<MonitorStatusBody>, MonitorError> {
    let mut store = state.store.lock().await;
    store.load()?;
    let stats = store.stats();
    Ok(Json(MonitorStatusBody {
        instance_id: state.instance_id.clone(),
        total: stats.total,
        running: stats.running,
        stopped: stats.stopped,
        failed: stats.failed,
        disabled: stats.disabled,
    }))
}

async fn list_processes(State(state): State<ApiState>) -> Result<Json<Vec<ProcessEntry>>, MonitorError> {
    let mut store = state.store.lock().await;
    store.load()?;
    let entries = store.registry().processes.values().cloned().collect();
    Ok(Json(entries))
}

#[derive(Serialize)]
struct ProcessDetailBody {
    #[serde(flatten)]
    entry: ProcessEntry,
    resource_usage: Option<crate::types::ResourceUsage>,
}

async fn get_process(
    State(state): State<ApiState>,
    AxPath(id): AxPath<String>,
) -> Result<Json<ProcessDetailBody>, MonitorError> {
    let mut store = state.store.lock().await;
    store.load()?;
    let entry = store
        .get(&id)
        .cloned()
        .ok_or_else(|| MonitorError::ProcessNotFound(id.clone()))?;
    let resource_usage = entry.pid.and_then(ProcessManager::get_resource_usage);
    Ok(Json(ProcessDetailBody { entry, resource_usage }))
}

async fn register_process(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(config): Json<ProcessConfig>,
) -> Result<StatusCode, Response> {
    gate_check(&state, &addr, RemoteOperation::Register, Some(&config.command)).await?;

    let mut store = state.store.lock().await;
    store.load().map_err(IntoResponse::into_response)?;
    store
        .upsert(ProcessEntry::new(config))
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::CREATED)
}

async fn deregister_process(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxPath(id): AxPath<String>,
) -> Result<StatusCode, Response> {
    gate_check(&state, &addr, RemoteOperation::Deregister, None).await?;

    let mut store = state.store.lock().await;
    store.load().map_err(IntoResponse::into_response)?;
    let removed = store.remove(&id).map_err(IntoResponse::into_response)?;
    if removed.is_none() {
        return Err(MonitorError::ProcessNotFound(id).into_response());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn start_process(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxPath(id): AxPath<String>,
) -> Result<StatusCode, Response> {
    let mut store = state.store.lock().await;
    store.load().map_err(IntoResponse::into_response)?;
    let entry = store
        .get(&id)
        .cloned()
        .ok_or_else(|| MonitorError::ProcessNotFound(id.clone()).into_response())?;
    drop(store);

    gate_check(&state, &addr, RemoteOperation::Start, Some(&entry.config.command)).await?;

    if !entry.enabled {
        return Err(MonitorError::ProcessDisabled(id).into_response());
    }

    let (pid, start_time) = ProcessManager::start_process(&entry, &state.log_dir)
        .map_err(|e| MonitorError::Internal(e.to_string()).into_response())?;

    let mut store = state.store.lock().await;
    store
        .with_lock("api-start", move |registry| {
            if let Some(e) = registry.get_mut(&id) {
                e.pid = Some(pid);
                e.start_time_token = Some(start_time);
                e.state = ProcessState::Running;
                e.last_started_at = Some(chrono::Utc::now());
                e.startup_completed = false;
            }
        })
        .map_err(IntoResponse::into_response)?;

    Ok(StatusCode::OK)
}

async fn stop_process(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxPath(id): AxPath<String>,
) -> Result<StatusCode, Response> {
    let mut store = state.store.lock().await;
    store.load().map_err(IntoResponse::into_response)?;
    let entry = store
        .get(&id)
        .cloned()
        .ok_or_else(|| MonitorError::ProcessNotFound(id.clone()).into_response())?;
    drop(store);

    gate_check(&state, &addr, RemoteOperation::Stop, Some(&entry.config.command)).await?;

    if let Some(pid) = entry.pid {
        ProcessManager::stop_process(pid).map_err(|e| MonitorError::Internal(e.to_string()).into_response())?;
    }

    let mut store = state.store.lock().await;
    store
        .with_lock("api-stop", move |registry| {
            if let Some(e) = registry.get_mut(&id) {
                e.pid = None;
                e.state = ProcessState::Stopped;
                e.last_stopped_at = Some(chrono::Utc::now());
            }
        })
        .map_err(IntoResponse::into_response)?;

    Ok(StatusCode::OK)
}

async fn disable_process(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxPath(id): AxPath<String>,
) -> Result<StatusCode, Response> {
    gate_check(&state, &addr, RemoteOperation::Disable, None).await?;

    let mut store = state.store.lock().await;
    store.load().map_err(IntoResponse::into_response)?;
    let existed = store
        .with_lock("api-disable", move |registry| {
            if let Some(e) = registry.get_mut(&id) {
                e.enabled = false;
                e.state = ProcessState::Disabled;
                true
            } else {
                false
            }
        })
        .map_err(IntoResponse::into_response)?;

    if !existed {
        return Err(StatusCode::NOT_FOUND.into_response());
    }
    Ok(StatusCode::OK)
}

async fn enable_process(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxPath(id): AxPath<String>,
) -> Result<StatusCode, Response> {
    gate_check(&state, &addr, RemoteOperation::Disable, None).await?;

    let mut store = state.store.lock().await;
    store.load().map_err(IntoResponse::into_response)?;
    let existed = store
        .with_lock("api-enable", move |registry| {
            if let Some(e) = registry.get_mut(&id) {
                e.enabled = true;
                e.state = ProcessState::Stopped;
                true
            } else {
                false
            }
        })
        .map_err(IntoResponse::into_response)?;

    if !existed {
        return Err(StatusCode::NOT_FOUND.into_response());
    }
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct AutostartBody {
    autostart: bool,
}

async fn set_autostart(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxPath(id): AxPath<String>,
    Json(body): Json<AutostartBody>,
) -> Result<StatusCode, Response> {
    gate_check(&state, &addr, RemoteOperation::Autostart, None).await?;

    let mut store = state.store.lock().await;
    store.load().map_err(IntoResponse::into_response)?;
    let existed = store
        .with_lock("api-autostart", move |registry| {
            if let Some(e) = registry.get_mut(&id) {
                e.config.autostart = body.autostart;
                true
            } else {
                false
            }
        })
        .map_err(IntoResponse::into_response)?;

    if !existed {
        return Err(StatusCode::NOT_FOUND.into_response());
    }
    Ok(StatusCode::OK)
}

async fn monitor_restart(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<StatusCode, Response> {
    gate_check(&state, &addr, RemoteOperation::MonitorRestart, None).await?;
    // The supervisor tick loop runs in its own task; signalling it a
    // restart-now request is out of this handler's scope today — it
    // acknowledges the request and lets the next scheduled tick apply.
    Ok(StatusCode::ACCEPTED)
}

#[derive(Serialize)]
struct TrustedHostsBody {
    trusted_hosts: Vec<String>,
}

async fn get_trusted_hosts(State(state): State<ApiState>) -> Result<Json<TrustedHostsBody>, MonitorError> {
    let mut store = state.store.lock().await;
    store.load()?;
    Ok(Json(TrustedHostsBody {
        trusted_hosts: store.registry().remote_access.trusted_hosts.clone(),
    }))
}

#[derive(Serialize)]
struct StandaloneModeBody {
    standalone_mode: bool,
}

async fn get_standalone_mode(State(state): State<ApiState>) -> Result<Json<StandaloneModeBody>, MonitorError> {
    let mut store = state.store.lock().await;
    store.load()?;
    Ok(Json(StandaloneModeBody {
        standalone_mode: store.registry().standalone_mode,
    }))
}
