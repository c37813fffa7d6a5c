#![allow(dead_code)]

use ops_daemon::{
    api::AppState, broadcast_router::BroadcastRouter, command_supervisor::CommandSupervisor,
    config::SupervisorConfig, connection_registry::ConnectionRegistry, server,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A daemon wired the way `main` wires it, minus signals and the PID file.
pub struct TestDaemon {
    pub state: AppState,
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl TestDaemon {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        grace_period_ms: 300,
        output_drain_ms: 500,
        ..SupervisorConfig::default()
    }
}

/// Builds the supervisor, registry and router, and starts the router task.
pub fn app_state() -> AppState {
    let (supervisor, events) = CommandSupervisor::new(test_config());
    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(BroadcastRouter::new(registry));
    tokio::spawn(router.clone().run(events));
    AppState::new(Arc::new(supervisor), router)
}

pub async fn spawn_daemon() -> TestDaemon {
    let state = app_state();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(state.clone(), listener, shutdown.clone()));
    TestDaemon {
        state,
        addr,
        shutdown,
    }
}

/// Polls `condition` every 10ms for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
