use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::OrchestratorConfig;

use super::control::ProcessControlAction;
use super::control::ProcessControlParams;
use super::control::ProcessControlResponse;
use super::control::ProcessControlStatus;
use super::errors::ProcessError;
use super::events::EventBus;
use super::events::EventSubscription;
use super::lifecycle::LifecycleController;
use super::params::ExecuteRequest;
use super::process_id::ProcessId;
use super::record::CompletionOutcome;
use super::record::ProcessMode;
use super::record::ProcessSnapshot;
use super::registry::ProcessRegistry;
use super::slot::SlotAllocator;
use super::slot::SlotState;
use super::spawner::ProcessSpawner;
use super::spawner::SpawnRequest;

/// Entry point for running shell commands on behalf of the agent.
///
/// Cheap to clone; all clones share the same registry, active slot and event
/// bus. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: OrchestratorConfig,
    controller: Arc<LifecycleController>,
    spawner: ProcessSpawner,
    sweeper: StdMutex<Option<Sweeper>>,
}

struct Sweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProcessManager {
    pub fn new(config: OrchestratorConfig) -> Self {
        let controller = Arc::new(LifecycleController::new(
            ProcessRegistry::default(),
            EventBus::new(config.event_capacity),
            SlotAllocator::spawn(),
            config.kill_grace_period(),
            config.output_limit(),
        ));
        let spawner = ProcessSpawner::new(Arc::clone(&controller), &config);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                controller,
                spawner,
                sweeper: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Starts `request` and returns its id once the OS spawn attempt is done.
    ///
    /// Active requests first wait for the active slot; dropping the returned
    /// future while queued withdraws the request. A command that cannot be
    /// launched still gets an id, with a failed record behind it.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ProcessId, ProcessError> {
        let id = ProcessId::new();
        let config = &self.inner.config;
        let cwd = config.resolve_cwd(request.cwd.as_deref());
        let (grant, timeout) = match request.mode {
            ProcessMode::Active => {
                let pending = self.inner.controller.slots().request(id)?;
                debug!(process_id = %id, command = %request.command, "waiting for active slot");
                (
                    Some(pending.granted().await?),
                    config.active_timeout(request.timeout_ms),
                )
            }
            ProcessMode::Background => (None, None),
        };
        let spawn = SpawnRequest {
            id,
            command: request.command,
            mode: request.mode,
            cwd,
            timeout,
        };
        Ok(self.inner.spawner.spawn(spawn, grant).await)
    }

    pub async fn demote(&self, id: ProcessId) -> bool {
        self.inner.controller.demote(id).await
    }

    pub async fn promote(&self, id: ProcessId) -> bool {
        self.inner.controller.promote(id).await
    }

    pub async fn kill(&self, id: ProcessId) -> bool {
        self.inner.controller.kill(id).await
    }

    pub async fn get(&self, id: ProcessId) -> Option<ProcessSnapshot> {
        self.inner.controller.registry().get(id).await
    }

    pub async fn list(&self) -> Vec<ProcessSnapshot> {
        self.inner.controller.registry().list().await
    }

    pub async fn wait_for_completion(&self, id: ProcessId) -> Option<CompletionOutcome> {
        self.inner.controller.wait_for_completion(id).await
    }

    /// Waits for the process to reach a terminal state, following it through
    /// any demotions. `None` if the id is unknown.
    pub async fn wait_for_exit(&self, id: ProcessId) -> Option<CompletionOutcome> {
        self.inner.controller.wait_for_exit(id).await
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.controller.events().subscribe()
    }

    pub fn subscribe_process(&self, id: ProcessId) -> EventSubscription {
        self.inner.controller.events().subscribe_process(id)
    }

    pub async fn slot_state(&self) -> Result<SlotState, ProcessError> {
        self.inner.controller.slots().state().await
    }

    /// Applies a control action and reports why it was refused, if it was.
    pub async fn control(&self, params: ProcessControlParams) -> ProcessControlResponse {
        let id = params.process_id();
        let action = params.action();
        let Some(snapshot) = self.get(id).await else {
            return ProcessControlResponse::new(id, ProcessControlStatus::NoSuchProcess);
        };
        if snapshot.record.status.is_terminal() {
            return ProcessControlResponse::new(id, ProcessControlStatus::AlreadyTerminated)
                .with_note(format!("process is {}", snapshot.record.status));
        }

        let applied = match action {
            ProcessControlAction::Demote => self.demote(id).await,
            ProcessControlAction::Promote => self.promote(id).await,
            ProcessControlAction::Kill => self.kill(id).await,
        };
        if applied {
            return ProcessControlResponse::new(id, ProcessControlStatus::Ack);
        }

        // Lost a race or the action does not fit the current mode.
        let status = match self.get(id).await {
            None => ProcessControlStatus::NoSuchProcess,
            Some(snapshot) if snapshot.record.status.is_terminal() => {
                ProcessControlStatus::AlreadyTerminated
            }
            Some(snapshot) => ProcessControlStatus::reject(format!(
                "cannot {action} a process in {} mode",
                snapshot.record.mode
            )),
        };
        ProcessControlResponse::new(id, status)
    }

    /// Starts the periodic retention sweep. Calling it again while the sweep
    /// is running does nothing.
    pub fn start(&self) {
        let mut sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let interval = self.inner.config.sweep_interval();
        let manager = Arc::downgrade(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = manager.upgrade() else {
                            break;
                        };
                        ProcessManager { inner }.sweep_now().await;
                    }
                }
            }
            debug!("retention sweep stopped");
        });
        info!(
            interval_ms = interval.as_millis() as u64,
            "retention sweep started"
        );
        *sweeper = Some(Sweeper { cancel, task });
    }

    /// Stops the retention sweep and waits for it to finish. Running
    /// processes are left alone.
    pub async fn shutdown(&self) {
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Sweeper { cancel, task }) = sweeper else {
            return;
        };
        cancel.cancel();
        if let Err(err) = task.await
            && !err.is_cancelled()
        {
            warn!("retention sweep task failed: {err}");
        }
    }

    /// Evicts terminal records older than the retention period and returns
    /// their ids.
    pub async fn sweep_now(&self) -> Vec<ProcessId> {
        let evicted = self
            .inner
            .controller
            .registry()
            .evict_terminal_older_than(self.inner.config.retention())
            .await;
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "evicted expired process records");
        }
        evicted
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.cancel.cancel();
        }
    }
}
