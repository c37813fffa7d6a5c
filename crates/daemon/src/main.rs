use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Arg, Command};
use ops_daemon::{
    api::AppState,
    broadcast_router::BroadcastRouter,
    command_supervisor::CommandSupervisor,
    config::load_config,
    connection_registry::ConnectionRegistry,
    pid_manager::PidManager,
    server,
};
use ops_types::SystemState;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ROUTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ops_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Ops daemon starting...");

    // --- Argument Parsing ---
    let matches = Command::new("opsd")
        .about("Runs shell commands and streams their output to WebSocket clients")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .value_parser(clap::value_parser!(u16))
                .help("Port to listen on (overrides config and PORT)"),
        )
        .arg(
            Arg::new("pid-file")
                .long("pid-file")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Refuse to start if this PID file names a live daemon"),
        )
        .get_matches();

    // --- Configuration ---
    let mut config = load_config(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    config.apply_env()?;
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(pid_file) = matches.get_one::<PathBuf>("pid-file") {
        config.pid_file = Some(pid_file.clone());
    }
    let addr = config.bind_addr()?;

    // Held until main returns; dropping it removes the file.
    let _pid_lock = match &config.pid_file {
        Some(path) => {
            let manager = PidManager::new(path);
            manager.acquire_lock()?;
            Some(manager)
        }
        None => None,
    };

    // --- Centralized State ---
    let (supervisor, events_rx) = CommandSupervisor::new(config.supervisor.clone());
    let supervisor = Arc::new(supervisor.with_working_dir(config.working_dir.clone()));
    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(BroadcastRouter::new(registry.clone()));
    let app_state = AppState::new(supervisor.clone(), router.clone());

    let router_handle = tokio::spawn(router.clone().run(events_rx));

    let shutdown = CancellationToken::new();
    if let Some(period) = config.health_interval() {
        tokio::spawn(server::run_health_reporter(
            app_state.clone(),
            period,
            shutdown.clone(),
        ));
    }

    // --- Server Task ---
    let mut server_handle = tokio::spawn(server::run(app_state.clone(), addr, shutdown.clone()));

    // --- Graceful Shutdown ---
    tokio::select! {
        result = shutdown_signal() => result.context("failed to listen for shutdown signals")?,
        result = &mut server_handle => {
            // The server only returns early on failure, e.g. a bind error.
            shutdown.cancel();
            supervisor.shutdown().await;
            return result.context("server task panicked")?;
        }
    }
    tracing::info!("Shutdown signal received. Stopping services...");

    router.on_system_status(
        app_state
            .system_status(SystemState::ShuttingDown)
            .with_message("Server is shutting down"),
    );

    let stopped = supervisor.shutdown().await;
    tracing::info!("Stopped {} running command(s).", stopped);

    // The supervisor dropped its event sender, so the router ends once drained.
    if tokio::time::timeout(ROUTER_DRAIN_TIMEOUT, router_handle)
        .await
        .is_err()
    {
        tracing::warn!("Broadcast router did not drain in time.");
    }

    let disconnected = registry.disconnect_all();
    tracing::debug!("Disconnected {} client(s).", disconnected);
    shutdown.cancel();

    match tokio::time::timeout(SERVER_STOP_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!("Server exited with error: {:#}", e),
        Ok(Err(e)) => tracing::error!("Server task failed: {}", e),
        Err(_) => tracing::warn!("Server did not stop in time."),
    }

    tracing::info!("Ops daemon stopped gracefully.");
    Ok(())
}
