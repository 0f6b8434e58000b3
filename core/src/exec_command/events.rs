use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::errors::ProcessFailure;
use super::output::OutputStream;
use super::process_id::ProcessId;
use super::record::ProcessMode;

/// Lifecycle or output notification about a single process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessEvent {
    pub process_id: ProcessId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProcessEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProcessEventKind {
    Started {
        mode: ProcessMode,
        command: String,
        cwd: PathBuf,
    },
    Output {
        stream: OutputStream,
        data: String,
    },
    /// The active timeout elapsed and the process moved to the background.
    Timeout {
        timeout_ms: u64,
    },
    ModeChanged {
        from: ProcessMode,
        to: ProcessMode,
    },
    Promoted,
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Failed {
        exit_code: Option<i32>,
        #[serde(rename = "error")]
        failure: ProcessFailure,
        stdout: String,
        stderr: String,
    },
    Killed {
        stdout: String,
        stderr: String,
    },
}

impl ProcessEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessEventKind::Started { .. } => "started",
            ProcessEventKind::Output { .. } => "output",
            ProcessEventKind::Timeout { .. } => "timeout",
            ProcessEventKind::ModeChanged { .. } => "mode-changed",
            ProcessEventKind::Promoted => "promoted",
            ProcessEventKind::Completed { .. } => "completed",
            ProcessEventKind::Failed { .. } => "failed",
            ProcessEventKind::Killed { .. } => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessEventKind::Completed { .. }
                | ProcessEventKind::Failed { .. }
                | ProcessEventKind::Killed { .. }
        )
    }

    /// Timeout or an explicit move from active to background.
    pub fn is_demotion(&self) -> bool {
        matches!(
            self,
            ProcessEventKind::Timeout { .. }
                | ProcessEventKind::ModeChanged {
                    to: ProcessMode::Background,
                    ..
                }
        )
    }
}

/// Fan-out of process events to any number of subscribers. There is no
/// replay: a subscriber only sees events published after it subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProcessEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, process_id: ProcessId, kind: ProcessEventKind) {
        let event = ProcessEvent {
            process_id,
            timestamp: Utc::now(),
            kind,
        };
        // No receivers is fine; the event is simply dropped.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter: None,
            missed: 0,
        }
    }

    /// Subscription that only yields events for `process_id`.
    pub fn subscribe_process(&self, process_id: ProcessId) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter: Some(process_id),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<ProcessEvent>,
    filter: Option<ProcessId>,
    missed: u64,
}

impl EventSubscription {
    /// Next matching event, or `None` once every publisher is gone. A slow
    /// subscriber that falls behind skips the overwritten events; the count is
    /// available through [`EventSubscription::missed`].
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.is_none_or(|id| id == event.process_id) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "process event subscriber lagged");
                    self.missed += skipped;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn into_stream(self) -> impl Stream<Item = ProcessEvent> {
        futures::stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }
}
