use crate::{
    api::{self, AppState},
    ws_session,
};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use http::StatusCode;
use ops_types::SystemState;
use serde_json::json;
use std::{any::Any, net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as CorsAny, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic message".to_string()
    };

    error!("PANIC CAUGHT: {}", details);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error", "code": "INTERNAL" })),
    )
        .into_response()
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_session::serve_client(state, socket))
}

/// The full HTTP application: REST facade, WebSocket endpoint and layers.
pub fn app(state: AppState) -> Router {
    api::create_router()
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(
            CorsLayer::new()
                .allow_origin(CorsAny)
                .allow_methods(CorsAny)
                .allow_headers(CorsAny),
        )
}

pub async fn run(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(state, listener, shutdown).await
}

/// Serves on an already bound listener until `shutdown` is cancelled.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Broadcasts a healthy `systemStatus` to every client on a fixed period.
pub async fn run_health_reporter(
    state: AppState,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let status = state.system_status(SystemState::Healthy);
                tracing::debug!(
                    active_commands = status.active_commands,
                    connected_clients = status.connected_clients,
                    "Broadcasting health status"
                );
                state.router.on_system_status(status);
            }
        }
    }
    info!("Health reporter stopped.");
}
