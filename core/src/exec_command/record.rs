use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::errors::ProcessFailure;
use super::output::OutputStream;
use super::output::append_retained;
use super::process_id::ProcessId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Occupies the single active slot; the agent is blocked on it.
    #[default]
    Active,
    Background,
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessMode::Active => write!(f, "active"),
            ProcessMode::Background => write!(f, "background"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Completed => write!(f, "completed"),
            ProcessStatus::Failed => write!(f, "failed"),
            ProcessStatus::Killed => write!(f, "killed"),
        }
    }
}

/// One shell invocation as tracked by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub command: String,
    pub mode: ProcessMode,
    pub status: ProcessStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub working_directory: PathBuf,
    /// OS pid while the child handle is held, i.e. while `status` is running.
    pub pid: Option<u32>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub failure: Option<ProcessFailure>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ProcessRecord {
    pub(crate) fn new(
        id: ProcessId,
        command: String,
        mode: ProcessMode,
        working_directory: PathBuf,
    ) -> Self {
        Self {
            id,
            command,
            mode,
            status: ProcessStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            exit_code: None,
            working_directory,
            pid: None,
            failure: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    /// Holds the active slot right now.
    pub fn is_active(&self) -> bool {
        self.mode == ProcessMode::Active && self.status == ProcessStatus::Running
    }

    pub fn is_background_running(&self) -> bool {
        self.mode == ProcessMode::Background && self.status == ProcessStatus::Running
    }

    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }

    pub(crate) fn append_output(&mut self, stream: OutputStream, data: &str, limit: Option<usize>) {
        let (buffer, truncated) = match stream {
            OutputStream::Stdout => (&mut self.stdout, &mut self.stdout_truncated),
            OutputStream::Stderr => (&mut self.stderr, &mut self.stderr_truncated),
        };
        if append_retained(buffer, data, limit) {
            *truncated = true;
        }
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            is_active: self.is_active(),
            duration_ms: self.duration().as_millis() as u64,
            record: self.clone(),
        }
    }
}

/// Point-in-time copy of a record with the derived fields filled in.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub is_active: bool,
    pub duration_ms: u64,
}

/// What `wait_for_completion` hands back. `completed == false` means the
/// process was demoted to the background and is still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionOutcome {
    pub completed: bool,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub mode: ProcessMode,
}

impl CompletionOutcome {
    pub(crate) fn finished(record: &ProcessRecord) -> Self {
        Self {
            completed: true,
            status: record.status,
            exit_code: record.exit_code,
            stdout: record.stdout.clone(),
            stderr: record.stderr.clone(),
            mode: record.mode,
        }
    }

    pub(crate) fn demoted(record: &ProcessRecord) -> Self {
        Self {
            completed: false,
            status: record.status,
            exit_code: None,
            stdout: record.stdout.clone(),
            stderr: record.stderr.clone(),
            mode: ProcessMode::Background,
        }
    }
}
