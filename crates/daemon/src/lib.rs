// Re-export modules for library use
pub mod api;
pub mod broadcast_router;
pub mod command_supervisor;
pub mod config;
pub mod connection_registry;
pub mod error;
pub mod pid_manager;
pub mod server;
pub mod ws_session;
