use serde::Serialize;
use serde_json::Value;
use serde_json::json;

pub const EXEC_COMMAND_TOOL_NAME: &str = "exec_command";
pub const PROCESS_CONTROL_TOOL_NAME: &str = "process_control";
pub const LIST_PROCESSES_TOOL_NAME: &str = "list_processes";
pub const WAIT_PROCESS_TOOL_NAME: &str = "wait_process";

/// Function tool definition in the shape model APIs expect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub fn create_exec_command_tool() -> ToolSpec {
    ToolSpec {
        name: EXEC_COMMAND_TOOL_NAME.to_string(),
        description: r#"Run a shell command.
- `active` (default) commands hold the single foreground slot; other active commands queue behind them.
- An active command that outlives `timeout_ms` keeps running in the background.
- `background` commands start immediately without taking the active slot.
- With `wait` (default true) the call returns once the command finishes, or once an active command is moved to the background."#
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "description": "Shell command as a string, or an argv array.",
                    "anyOf": [
                        { "type": "string" },
                        { "type": "array", "items": { "type": "string" } }
                    ]
                },
                "mode": {
                    "type": "string",
                    "enum": ["active", "background"],
                    "description": "Defaults to active."
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory for the command."
                },
                "timeout_ms": {
                    "type": "number",
                    "description": "Active mode only: move to the background after this long. 0 disables."
                },
                "wait": {
                    "type": "boolean",
                    "description": "Wait for completion or demotion before returning. Default: true."
                }
            },
            "required": ["cmd"],
            "additionalProperties": false
        }),
    }
}

pub fn create_process_control_tool() -> ToolSpec {
    ToolSpec {
        name: PROCESS_CONTROL_TOOL_NAME.to_string(),
        description: "Demote the active process, promote a background process into the active slot, or kill a process."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "process_id": { "type": "string" },
                "action": {
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["demote", "promote", "kill"] }
                    },
                    "required": ["type"]
                }
            },
            "required": ["process_id", "action"],
            "additionalProperties": false
        }),
    }
}

pub fn create_list_processes_tool() -> ToolSpec {
    ToolSpec {
        name: LIST_PROCESSES_TOOL_NAME.to_string(),
        description: "List tracked processes, oldest first.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["running", "completed", "failed", "killed"]
                },
                "limit": { "type": "number" }
            },
            "additionalProperties": false
        }),
    }
}

pub fn create_wait_process_tool() -> ToolSpec {
    ToolSpec {
        name: WAIT_PROCESS_TOOL_NAME.to_string(),
        description: "Wait until a process finishes, or until it is demoted out of the active slot.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "process_id": { "type": "string" }
            },
            "required": ["process_id"],
            "additionalProperties": false
        }),
    }
}

pub fn process_tools() -> Vec<ToolSpec> {
    vec![
        create_exec_command_tool(),
        create_process_control_tool(),
        create_list_processes_tool(),
        create_wait_process_tool(),
    ]
}
