pub mod run_cmd;
pub mod tool_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use agent_exec_core::OrchestratorConfig;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;

pub use run_cmd::RunArgs;
pub use tool_cmd::ToolArgs;

/// Run shell commands through the agent process orchestrator.
#[derive(Debug, Parser)]
#[command(name = "agent-exec", version)]
pub struct Cli {
    /// TOML file with orchestrator settings.
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Override the shell used to run commands.
    #[arg(long = "shell", value_name = "PATH", global = true)]
    pub shell: Option<PathBuf>,

    /// Override the kill grace period in milliseconds.
    #[arg(long = "kill-grace-ms", value_name = "MS", global = true)]
    pub kill_grace_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute commands and print each outcome as a JSON line.
    Run(RunArgs),
    /// Invoke one of the process tools with JSON arguments.
    Tool(ToolArgs),
    /// Print the process tool definitions as JSON.
    Tools,
    /// Print the effective configuration as TOML.
    Config,
}

impl Cli {
    pub fn load_config(&self) -> Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => OrchestratorConfig::default(),
        };
        if let Some(shell) = &self.shell {
            config.shell = shell.clone();
        }
        if let Some(grace) = self.kill_grace_ms {
            config.kill_grace_period_ms = grace;
        }
        config.validate()?;
        Ok(config)
    }
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let config = cli.load_config()?;
    match cli.command {
        Command::Run(args) => run_cmd::run(config, args).await,
        Command::Tool(args) => tool_cmd::run(config, args).await,
        Command::Tools => {
            tool_cmd::print_tool_specs()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            let rendered = config.to_toml_string().context("serializing config")?;
            print!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
    }
}
