//! Error types for the daemon

use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Reasons a command could not be launched. Reported synchronously by
/// `CommandSupervisor::start`; no command id exists for a failed spawn.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("empty command")]
    EmptyInvocation,

    #[error("executable not found: {program}")]
    NotFound { program: String },

    #[error("permission denied: {program}")]
    PermissionDenied { program: String },

    #[error("resource exhaustion while spawning {program}: {source}")]
    ResourceExhausted {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    /// Classifies an OS spawn failure.
    pub fn from_io(program: &str, source: io::Error) -> Self {
        let program = program.to_string();
        match source.kind() {
            io::ErrorKind::NotFound => return SpawnError::NotFound { program },
            io::ErrorKind::PermissionDenied => return SpawnError::PermissionDenied { program },
            _ => {}
        }

        let exhausted = source.raw_os_error().is_some_and(|code| {
            [Errno::EAGAIN, Errno::ENOMEM, Errno::EMFILE, Errno::ENFILE]
                .iter()
                .any(|errno| *errno as i32 == code)
        });
        if exhausted {
            SpawnError::ResourceExhausted { program, source }
        } else {
            SpawnError::Io { program, source }
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            SpawnError::EmptyInvocation => "EMPTY_COMMAND",
            SpawnError::NotFound { .. } => "EXECUTABLE_NOT_FOUND",
            SpawnError::PermissionDenied { .. } => "PERMISSION_DENIED",
            SpawnError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            SpawnError::ShuttingDown => "SHUTTING_DOWN",
            SpawnError::Io { .. } => "SPAWN_FAILED",
        }
    }
}
