//! JSON seam between the tool-calling layer and the [`crate::ProcessManager`].

pub mod handlers;
pub mod spec;

use async_trait::async_trait;
use thiserror::Error;

use crate::exec_command::ProcessError;

/// One function call issued by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool_name: String,
    /// Raw JSON arguments as the model sent them.
    pub arguments: String,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// JSON document handed back to the model.
    pub content: String,
    pub success: bool,
}

#[derive(Debug, Error)]
pub enum ToolCallError {
    /// The model made a mistake it can correct; the message goes back to it.
    #[error("{0}")]
    RespondToModel(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn handles(&self, tool_name: &str) -> bool;

    async fn handle(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolCallError>;
}
