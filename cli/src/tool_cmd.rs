use std::io::Write;
use std::process::ExitCode;

use agent_exec_core::OrchestratorConfig;
use agent_exec_core::ProcessManager;
use agent_exec_core::ProcessToolHandler;
use agent_exec_core::ToolCallError;
use agent_exec_core::ToolHandler;
use agent_exec_core::ToolInvocation;
use agent_exec_core::tools::spec::process_tools;
use anyhow::Result;
use clap::Parser;

#[derive(Debug, Parser)]
pub struct ToolArgs {
    /// Tool name, e.g. `exec_command`.
    #[arg(value_name = "TOOL")]
    pub name: String,

    /// JSON arguments for the tool.
    #[arg(value_name = "JSON", default_value = "{}")]
    pub arguments: String,
}

pub async fn run(config: OrchestratorConfig, args: ToolArgs) -> Result<ExitCode> {
    let handler = ProcessToolHandler::new(ProcessManager::new(config));
    if !handler.handles(&args.name) {
        anyhow::bail!("unknown tool {}", args.name);
    }
    let invocation = ToolInvocation::new(args.name, args.arguments);
    match handler.handle(invocation).await {
        Ok(output) => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", output.content)?;
            Ok(if output.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(ToolCallError::RespondToModel(message)) => {
            // Same text the model would see.
            let mut stderr = std::io::stderr().lock();
            writeln!(stderr, "{message}")?;
            Ok(ExitCode::from(2))
        }
        Err(err) => Err(err.into()),
    }
}

pub fn print_tool_specs() -> Result<()> {
    let rendered = serde_json::to_string_pretty(&process_tools())?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{rendered}")?;
    Ok(())
}
