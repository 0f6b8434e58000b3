use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use agent_exec_core::CompletionOutcome;
use agent_exec_core::EventSubscription;
use agent_exec_core::ExecuteRequest;
use agent_exec_core::OrchestratorConfig;
use agent_exec_core::ProcessId;
use agent_exec_core::ProcessManager;
use agent_exec_core::ProcessMode;
use agent_exec_core::ProcessStatus;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::ValueEnum;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Slot mode for every command.
    #[arg(long = "mode", value_enum, default_value_t = ModeArg::Active)]
    pub mode: ModeArg,

    /// Active mode: move a command to the background after this long.
    /// 0 disables the timer.
    #[arg(long = "timeout-ms", value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Working directory for the commands.
    #[arg(long = "cwd", value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Also print every process event as a JSON line.
    #[arg(long = "events", default_value_t = false)]
    pub events: bool,

    /// Shell commands; each one becomes its own process.
    #[arg(value_name = "COMMAND", required = true)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Active,
    Background,
}

impl From<ModeArg> for ProcessMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Active => ProcessMode::Active,
            ModeArg::Background => ProcessMode::Background,
        }
    }
}

#[derive(Debug, Serialize)]
struct OutcomeLine<'a> {
    process_id: ProcessId,
    command: &'a str,
    #[serde(flatten)]
    outcome: CompletionOutcome,
}

pub async fn run(config: OrchestratorConfig, args: RunArgs) -> Result<ExitCode> {
    let manager = ProcessManager::new(config);
    let printer = args
        .events
        .then(|| tokio::spawn(print_events(manager.subscribe(), args.commands.len())));

    let launches = args
        .commands
        .iter()
        .map(|command| {
            let mut request = ExecuteRequest::new(command.clone(), args.mode.into());
            request.cwd = args.cwd.clone();
            request.timeout_ms = args.timeout_ms;
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute(request).await })
        })
        .collect::<Vec<_>>();

    let mut all_completed = true;
    for (command, launch) in args.commands.iter().zip(launches) {
        let id = launch.await.context("execute task panicked")??;
        let outcome = manager
            .wait_for_completion(id)
            .await
            .context("process record vanished")?;
        let outcome = if outcome.completed {
            outcome
        } else {
            // Report the demotion, then keep following the process.
            print_line(&OutcomeLine {
                process_id: id,
                command,
                outcome,
            })?;
            manager
                .wait_for_exit(id)
                .await
                .context("process record vanished")?
        };
        all_completed &= outcome.status == ProcessStatus::Completed;
        print_line(&OutcomeLine {
            process_id: id,
            command,
            outcome,
        })?;
    }

    if let Some(printer) = printer
        && let Err(err) = printer.await
    {
        warn!("event printer failed: {err}");
    }

    Ok(if all_completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn print_events(mut events: EventSubscription, expected: usize) {
    let mut finished = 0;
    while finished < expected {
        let Some(event) = events.recv().await else {
            break;
        };
        if event.kind.is_terminal() {
            finished += 1;
        }
        if let Err(err) = print_line(&event) {
            debug!("stopping event output: {err}");
            break;
        }
    }
}

fn print_line<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mode_arg_maps_onto_process_mode() {
        assert_eq!(ProcessMode::from(ModeArg::Active), ProcessMode::Active);
        assert_eq!(
            ProcessMode::from(ModeArg::Background),
            ProcessMode::Background
        );
    }
}
