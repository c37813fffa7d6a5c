//! Shared types for the operations daemon
//!
//! This crate holds the identifiers, command records, supervisor events and the
//! real-time wire protocol used between the daemon and its WebSocket clients.

pub mod ids;
pub mod command;
pub mod event;
pub mod comms;

// Re-export commonly used types
pub use ids::*;
pub use command::*;
pub use event::*;
pub use comms::*;
