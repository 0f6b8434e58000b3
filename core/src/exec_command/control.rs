use serde::Deserialize;
use serde::Serialize;
use std::fmt;

use super::process_id::ProcessId;

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessControlParams {
    pub(crate) process_id: ProcessId,
    pub(crate) action: ProcessControlAction,
}

impl ProcessControlParams {
    pub fn new(process_id: ProcessId, action: ProcessControlAction) -> Self {
        Self { process_id, action }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn action(&self) -> ProcessControlAction {
        self.action
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessControlAction {
    /// Move the active process to the background.
    Demote,
    /// Move a background process into the active slot, waiting for it if
    /// necessary.
    Promote,
    Kill,
}

impl fmt::Display for ProcessControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Demote => write!(f, "demote"),
            Self::Promote => write!(f, "promote"),
            Self::Kill => write!(f, "kill"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessControlResponse {
    pub process_id: ProcessId,
    pub status: ProcessControlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ProcessControlResponse {
    pub(crate) fn new(process_id: ProcessId, status: ProcessControlStatus) -> Self {
        Self {
            process_id,
            status,
            note: None,
        }
    }

    pub(crate) fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_ack(&self) -> bool {
        self.status == ProcessControlStatus::Ack
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessControlStatus {
    Ack,
    NoSuchProcess,
    AlreadyTerminated,
    Reject(String),
}

impl ProcessControlStatus {
    pub(crate) fn reject(msg: impl Into<String>) -> Self {
        Self::Reject(msg.into())
    }
}

impl fmt::Display for ProcessControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::NoSuchProcess => write!(f, "no_such_process"),
            Self::AlreadyTerminated => write!(f, "already_terminated"),
            Self::Reject(msg) => write!(f, "reject({msg})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn action_is_tagged_by_type() {
        let id = ProcessId::new();
        let params: ProcessControlParams = serde_json::from_value(json!({
            "process_id": id.to_string(),
            "action": { "type": "promote" },
        }))
        .expect("deserialize control params");
        assert_eq!(params.process_id(), id);
        assert_eq!(params.action(), ProcessControlAction::Promote);
    }

    #[test]
    fn reject_serializes_with_reason() {
        let id = ProcessId::new();
        let response = ProcessControlResponse::new(id, ProcessControlStatus::reject("busy"));
        assert_eq!(
            serde_json::to_value(&response).expect("serialize"),
            json!({ "process_id": id.to_string(), "status": { "reject": "busy" } })
        );
        assert_eq!(response.status.to_string(), "reject(busy)");
    }
}
