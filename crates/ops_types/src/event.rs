//! Events emitted by the command supervisor and the system as a whole.
//!
//! `CommandEvent` is the single typed channel between the supervisor and the
//! broadcast router. For any one command the supervisor emits a `Running`
//! status, zero or more `Output` chunks, and exactly one terminal status.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::CommandStatus;
use crate::ids::CommandId;

/// Which output pipe a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    Output {
        command_id: CommandId,
        stream: OutputStream,
        data: Bytes,
    },
    Status {
        command_id: CommandId,
        status: CommandStatus,
        exit_code: Option<i32>,
    },
}

impl CommandEvent {
    pub fn command_id(&self) -> CommandId {
        match self {
            Self::Output { command_id, .. } | Self::Status { command_id, .. } => *command_id,
        }
    }

    /// True for the last event a command will ever produce.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Status { status, .. } if status.is_terminal())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemState {
    Healthy,
    ShuttingDown,
}

/// Process-wide notice delivered to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub state: SystemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub active_commands: usize,
    pub connected_clients: usize,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl SystemStatus {
    pub fn new(state: SystemState) -> Self {
        Self {
            state,
            message: None,
            active_commands: 0,
            connected_clients: 0,
            uptime_secs: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
