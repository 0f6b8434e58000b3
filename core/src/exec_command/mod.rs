mod control;
mod errors;
mod events;
mod lifecycle;
mod manager;
mod output;
mod params;
mod process_id;
mod record;
mod registry;
mod slot;
mod spawner;

pub use control::ProcessControlAction;
pub use control::ProcessControlParams;
pub use control::ProcessControlResponse;
pub use control::ProcessControlStatus;
pub use errors::ProcessError;
pub use errors::ProcessFailure;
pub use events::EventBus;
pub use events::EventSubscription;
pub use events::ProcessEvent;
pub use events::ProcessEventKind;
pub use manager::ProcessManager;
pub use output::OutputStream;
pub use params::ExecuteRequest;
pub use process_id::ProcessId;
pub use record::CompletionOutcome;
pub use record::ProcessMode;
pub use record::ProcessRecord;
pub use record::ProcessSnapshot;
pub use record::ProcessStatus;
pub use slot::PendingGrant;
pub use slot::SlotAllocator;
pub use slot::SlotGrant;
pub use slot::SlotState;
