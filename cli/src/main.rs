use std::process::ExitCode;

use agent_exec_cli::Cli;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    setup_tracing();
    let cli = Cli::parse();
    agent_exec_cli::run(cli).await
}

/// Logs go to stderr so stdout stays machine-readable. Filter with `RUST_LOG`.
fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
