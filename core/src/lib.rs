//! Process orchestration for an AI coding agent: one active (blocking) shell
//! command at a time, any number of background ones, and an event stream
//! describing everything that happens to them.

pub mod config;
pub mod exec_command;
mod process_death;
pub mod tools;

pub use config::ConfigError;
pub use config::OrchestratorConfig;
pub use exec_command::CompletionOutcome;
pub use exec_command::EventSubscription;
pub use exec_command::ExecuteRequest;
pub use exec_command::ProcessControlAction;
pub use exec_command::ProcessControlParams;
pub use exec_command::ProcessControlResponse;
pub use exec_command::ProcessControlStatus;
pub use exec_command::ProcessError;
pub use exec_command::ProcessEvent;
pub use exec_command::ProcessEventKind;
pub use exec_command::ProcessFailure;
pub use exec_command::ProcessId;
pub use exec_command::ProcessManager;
pub use exec_command::ProcessMode;
pub use exec_command::ProcessRecord;
pub use exec_command::ProcessSnapshot;
pub use exec_command::ProcessStatus;
pub use exec_command::SlotState;
pub use tools::ToolCallError;
pub use tools::ToolHandler;
pub use tools::ToolInvocation;
pub use tools::ToolOutput;
pub use tools::handlers::ProcessToolHandler;
