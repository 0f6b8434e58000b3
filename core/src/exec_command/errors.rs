use serde::Serialize;
use thiserror::Error;

/// Errors surfaced synchronously to callers of the manager. Everything that
/// happens to a child process after `execute()` returns is reported through
/// the record's status and the event stream instead.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("active slot allocator is no longer running")]
    AllocatorClosed,
}

/// Why a process ended up in the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessFailure {
    #[error("failed to spawn command: {message}")]
    Spawn { message: String },
    #[error("process runtime error: {message}")]
    Runtime { message: String },
    #[error("process exited with code {exit_code}")]
    NonZeroExit { exit_code: i32 },
}

impl ProcessFailure {
    pub(crate) fn spawn(error: &std::io::Error) -> Self {
        Self::Spawn {
            message: error.to_string(),
        }
    }

    pub(crate) fn runtime(error: &std::io::Error) -> Self {
        Self::Runtime {
            message: error.to_string(),
        }
    }
}
