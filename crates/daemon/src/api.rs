use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use ops_types::{ClientId, CommandId, CommandStatus, Invocation, SystemState, SystemStatus};
use serde::Deserialize;
use serde_json::json;
use std::{path::PathBuf, sync::Arc, time::Instant};

use crate::broadcast_router::BroadcastRouter;
use crate::command_supervisor::CommandSupervisor;
use crate::connection_registry::ConnectionRegistry;
use crate::error::SpawnError;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<CommandSupervisor>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<BroadcastRouter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(supervisor: Arc<CommandSupervisor>, router: Arc<BroadcastRouter>) -> Self {
        Self {
            supervisor,
            registry: router.registry().clone(),
            router,
            started_at: Instant::now(),
        }
    }

    /// Snapshot of the daemon's health as broadcast to clients.
    pub fn system_status(&self, state: SystemState) -> SystemStatus {
        SystemStatus {
            state,
            message: None,
            active_commands: self.supervisor.active_count(),
            connected_clients: self.registry.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCommandPayload {
    pub command: String,
    /// Explicit arguments; when absent `command` is split shell-style.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Client to subscribe before the command produces any output.
    #[serde(default)]
    pub subscriber: Option<ClientId>,
}

impl StartCommandPayload {
    /// Returns `None` when the command line has unbalanced quotes.
    pub fn to_invocation(&self) -> Option<Invocation> {
        let invocation = if self.shell {
            Invocation::shell(self.command.clone()).args(self.args.clone().unwrap_or_default())
        } else if let Some(args) = &self.args {
            Invocation::new(self.command.clone()).args(args.clone())
        } else {
            let mut words = shlex::split(&self.command)?.into_iter();
            match words.next() {
                Some(program) => Invocation::new(program).args(words),
                None => Invocation::new(String::new()),
            }
        };
        Some(match &self.cwd {
            Some(dir) => invocation.current_dir(dir.clone()),
            None => invocation,
        })
    }
}

fn error_response(status: StatusCode, code: &str, message: impl std::fmt::Display) -> Response {
    let body = json!({
        "error": message.to_string(),
        "code": code,
    });
    (status, Json(body)).into_response()
}

fn spawn_error_response(err: &SpawnError) -> Response {
    let status = match err {
        SpawnError::EmptyInvocation => StatusCode::BAD_REQUEST,
        SpawnError::NotFound { .. } => StatusCode::NOT_FOUND,
        SpawnError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        SpawnError::ResourceExhausted { .. } | SpawnError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SpawnError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.code(), err)
}

pub async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": "Server is running", "status": "OK" }))
}

pub async fn start_command_handler(
    State(state): State<AppState>,
    Json(payload): Json<StartCommandPayload>,
) -> impl IntoResponse {
    tracing::info!("Request to start command: {}", payload.command);

    let Some(invocation) = payload.to_invocation() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_COMMAND",
            "Unbalanced quotes in command",
        );
    };

    let registry = state.registry.clone();
    let subscriber = payload.subscriber;
    let started = state.supervisor.start_with(invocation, |command_id| {
        if let Some(client_id) = subscriber {
            if !registry.subscribe(&client_id, command_id) {
                tracing::warn!(client_id = %client_id, "Requested subscriber is not connected");
            }
        }
    });

    match started {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({ "id": id, "status": CommandStatus::Running })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Failed to start command '{}': {}", payload.command, e);
            spawn_error_response(&e)
        }
    }
}

pub async fn list_commands_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.list())
}

pub async fn get_command_handler(
    Path(id): Path<CommandId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.supervisor.get(&id) {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "COMMAND_NOT_FOUND", "Command not found"),
    }
}

pub async fn stop_command_handler(
    Path(id): Path<CommandId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    tracing::info!("Request to stop command: {}", id);

    if state.supervisor.get(&id).is_none() {
        return error_response(StatusCode::NOT_FOUND, "COMMAND_NOT_FOUND", "Command not found");
    }
    state.supervisor.stop(&id).await;

    match state.supervisor.get(&id) {
        Some(record) => Json(record).into_response(),
        // Evicted from the history while stopping.
        None => Json(json!({ "id": id, "status": CommandStatus::Stopped })).into_response(),
    }
}

pub async fn stop_all_handler(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("Request to stop all commands");
    let stopped = state.supervisor.stop_all().await;
    Json(json!({ "stopped": stopped }))
}

pub async fn system_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.system_status(SystemState::Healthy))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(root_handler))
        .route(
            "/api/commands",
            get(list_commands_handler).post(start_command_handler),
        )
        .route("/api/commands/:id", get(get_command_handler))
        .route("/api/commands/:id/stop", post(stop_command_handler))
        .route("/api/system/stop-all", post(stop_all_handler))
        .route("/api/system/status", get(system_status_handler))
}
