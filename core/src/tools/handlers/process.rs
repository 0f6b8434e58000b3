use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::exec_command::CompletionOutcome;
use crate::exec_command::ExecuteRequest;
use crate::exec_command::ProcessControlParams;
use crate::exec_command::ProcessId;
use crate::exec_command::ProcessManager;
use crate::exec_command::ProcessSnapshot;
use crate::exec_command::ProcessStatus;
use crate::tools::ToolCallError;
use crate::tools::ToolHandler;
use crate::tools::ToolInvocation;
use crate::tools::ToolOutput;
use crate::tools::spec::EXEC_COMMAND_TOOL_NAME;
use crate::tools::spec::LIST_PROCESSES_TOOL_NAME;
use crate::tools::spec::PROCESS_CONTROL_TOOL_NAME;
use crate::tools::spec::WAIT_PROCESS_TOOL_NAME;

pub struct ProcessToolHandler {
    manager: ProcessManager,
}

#[derive(Debug, Deserialize)]
struct ExecCommandArgs {
    #[serde(flatten)]
    request: ExecuteRequest,
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListProcessesArgs {
    #[serde(default)]
    status: Option<ProcessStatus>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WaitProcessArgs {
    process_id: ProcessId,
}

#[derive(Debug, Serialize)]
struct WaitResponse {
    process_id: ProcessId,
    #[serde(flatten)]
    outcome: CompletionOutcome,
}

impl ProcessToolHandler {
    pub fn new(manager: ProcessManager) -> Self {
        Self { manager }
    }

    async fn exec_command(&self, args: ExecCommandArgs) -> Result<ToolOutput, ToolCallError> {
        let id = self.manager.execute(args.request).await?;
        if !args.wait {
            let snapshot = self.snapshot(id).await?;
            let success = snapshot.record.status != ProcessStatus::Failed;
            return to_output(&snapshot, success);
        }
        self.wait_process(id).await
    }

    async fn wait_process(&self, process_id: ProcessId) -> Result<ToolOutput, ToolCallError> {
        let outcome = self
            .manager
            .wait_for_completion(process_id)
            .await
            .ok_or_else(|| unknown_process(process_id))?;
        let success = matches!(
            outcome.status,
            ProcessStatus::Running | ProcessStatus::Completed
        );
        to_output(
            &WaitResponse {
                process_id,
                outcome,
            },
            success,
        )
    }

    async fn list_processes(&self, args: ListProcessesArgs) -> Result<ToolOutput, ToolCallError> {
        let mut processes = self.manager.list().await;
        if let Some(status) = args.status {
            processes.retain(|snapshot| snapshot.record.status == status);
        }
        if let Some(limit) = args.limit {
            // Keep the most recent ones.
            let skip = processes.len().saturating_sub(limit);
            processes.drain(..skip);
        }
        to_output(&processes, true)
    }

    async fn snapshot(&self, id: ProcessId) -> Result<ProcessSnapshot, ToolCallError> {
        self.manager
            .get(id)
            .await
            .ok_or_else(|| unknown_process(id))
    }
}

#[async_trait]
impl ToolHandler for ProcessToolHandler {
    fn handles(&self, tool_name: &str) -> bool {
        matches!(
            tool_name,
            EXEC_COMMAND_TOOL_NAME
                | PROCESS_CONTROL_TOOL_NAME
                | LIST_PROCESSES_TOOL_NAME
                | WAIT_PROCESS_TOOL_NAME
        )
    }

    async fn handle(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolCallError> {
        let ToolInvocation {
            tool_name,
            arguments,
        } = invocation;

        match tool_name.as_str() {
            EXEC_COMMAND_TOOL_NAME => self.exec_command(parse_arguments(&arguments)?).await,
            PROCESS_CONTROL_TOOL_NAME => {
                let params: ProcessControlParams = parse_arguments(&arguments)?;
                let response = self.manager.control(params).await;
                let success = response.is_ack();
                to_output(&response, success)
            }
            LIST_PROCESSES_TOOL_NAME => {
                let args = if arguments.trim().is_empty() {
                    ListProcessesArgs::default()
                } else {
                    parse_arguments(&arguments)?
                };
                self.list_processes(args).await
            }
            WAIT_PROCESS_TOOL_NAME => {
                let args: WaitProcessArgs = parse_arguments(&arguments)?;
                self.wait_process(args.process_id).await
            }
            _ => Err(ToolCallError::RespondToModel(format!(
                "process handler does not support tool {tool_name}"
            ))),
        }
    }
}

fn parse_arguments<T: DeserializeOwned>(arguments: &str) -> Result<T, ToolCallError> {
    serde_json::from_str(arguments).map_err(|e| {
        ToolCallError::RespondToModel(format!("failed to parse function arguments: {e}"))
    })
}

fn to_output<T: Serialize>(value: &T, success: bool) -> Result<ToolOutput, ToolCallError> {
    let content = serde_json::to_string(value).map_err(|e| {
        ToolCallError::RespondToModel(format!("failed to serialize tool output: {e}"))
    })?;
    Ok(ToolOutput { content, success })
}

fn unknown_process(id: ProcessId) -> ToolCallError {
    ToolCallError::RespondToModel(format!("unknown process id {id}"))
}
