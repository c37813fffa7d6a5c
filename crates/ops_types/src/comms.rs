//! Real-time wire protocol: JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::command::CommandStatus;
use crate::event::{CommandEvent, OutputStream, SystemStatus};
use crate::ids::{ClientId, CommandId};

/// Messages a client may send to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { command_id: CommandId },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { command_id: CommandId },
}

/// Why an inbound frame could not be understood.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has no `type` field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("binary frames are not supported")]
    BinaryFrame,
}

impl ClientMessage {
    const KNOWN_TYPES: [&'static str; 2] = ["subscribe", "unsubscribe"];

    /// Parses a text frame, separating unknown message types from payloads
    /// that are not valid JSON or are missing fields.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !Self::KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Messages the daemon sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// First message on every connection.
    #[serde(rename_all = "camelCase")]
    Connection { client_id: ClientId },
    #[serde(rename_all = "camelCase")]
    Subscribed { command_id: CommandId },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { command_id: CommandId },
    #[serde(rename_all = "camelCase")]
    CommandOutput {
        command_id: CommandId,
        stream: OutputStream,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    CommandStatus {
        command_id: CommandId,
        status: CommandStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    SystemStatus(SystemStatus),
}

impl ServerMessage {
    /// The command this message concerns, if any.
    pub fn command_id(&self) -> Option<CommandId> {
        match self {
            Self::Subscribed { command_id }
            | Self::Unsubscribed { command_id }
            | Self::CommandOutput { command_id, .. }
            | Self::CommandStatus { command_id, .. } => Some(*command_id),
            Self::Connection { .. } | Self::SystemStatus(_) => None,
        }
    }
}

impl From<&CommandEvent> for ServerMessage {
    fn from(event: &CommandEvent) -> Self {
        match event {
            CommandEvent::Output {
                command_id,
                stream,
                data,
            } => ServerMessage::CommandOutput {
                command_id: *command_id,
                stream: *stream,
                data: String::from_utf8_lossy(data).into_owned(),
            },
            CommandEvent::Status {
                command_id,
                status,
                exit_code,
            } => ServerMessage::CommandStatus {
                command_id: *command_id,
                status: *status,
                exit_code: *exit_code,
            },
        }
    }
}
