//! The process state machine.
//!
//! Every transition happens while holding the registry lock, which is what
//! makes a manual demote/kill and a racing timer or exit mutually exclusive:
//! whichever takes the lock first wins and the other finds the record already
//! moved on.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::errors::ProcessFailure;
use super::events::EventBus;
use super::events::ProcessEventKind;
use super::output::OutputStream;
use super::process_id::ProcessId;
use super::record::CompletionOutcome;
use super::record::ProcessMode;
use super::record::ProcessRecord;
use super::record::ProcessStatus;
use super::registry::ProcessEntry;
use super::registry::ProcessRegistry;
use super::slot::SlotAllocator;
use super::spawner::OsHandle;
use super::spawner::SpawnRequest;
use super::spawner::exit_code_of;

/// Armed active-mode timer. Dropping the handle disarms it.
#[derive(Debug)]
pub(crate) struct TimeoutHandle {
    generation: u64,
    timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl TimeoutHandle {
    /// Detaches the timer task instead of aborting it; used by the timer task
    /// itself once it has fired.
    fn defuse(mut self) -> Duration {
        self.task = None;
        self.timeout
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) struct LifecycleController {
    registry: ProcessRegistry,
    events: EventBus,
    slots: SlotAllocator,
    kill_grace: Duration,
    output_limit: Option<usize>,
    timer_generation: AtomicU64,
}

impl LifecycleController {
    pub(crate) fn new(
        registry: ProcessRegistry,
        events: EventBus,
        slots: SlotAllocator,
        kill_grace: Duration,
        output_limit: Option<usize>,
    ) -> Self {
        Self {
            registry,
            events,
            slots,
            kill_grace,
            output_limit,
            timer_generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    /// Inserts the freshly spawned process and arms its timer when it runs in
    /// the active slot with a finite timeout.
    pub(crate) async fn register_running(self: &Arc<Self>, request: &SpawnRequest, handle: OsHandle) {
        let id = request.id;
        let pid = handle.pid();
        let mut record =
            ProcessRecord::new(id, request.command.clone(), request.mode, request.cwd.clone());
        record.pid = pid;
        let mut entry = ProcessEntry::new(record);
        entry.os_handle = Some(handle);

        let mut entries = self.registry.lock().await;
        if request.mode == ProcessMode::Active
            && let Some(timeout) = request.timeout
        {
            entry.timeout = Some(self.arm_timeout(id, timeout));
        }
        entries.insert(id, entry);
        info!(process_id = %id, mode = %request.mode, pid, "process started");
        self.events.publish(
            id,
            ProcessEventKind::Started {
                mode: request.mode,
                command: request.command.clone(),
                cwd: request.cwd.clone(),
            },
        );
    }

    fn arm_timeout(self: &Arc<Self>, id: ProcessId, timeout: Duration) -> TimeoutHandle {
        let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let controller = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            controller.on_timeout(id, generation).await;
        });
        TimeoutHandle {
            generation,
            timeout,
            task: Some(task),
        }
    }

    pub(crate) async fn record_spawn_failure(&self, request: &SpawnRequest, err: &io::Error) {
        let failure = ProcessFailure::spawn(err);
        let mut record = ProcessRecord::new(
            request.id,
            request.command.clone(),
            request.mode,
            request.cwd.clone(),
        );
        record.status = ProcessStatus::Failed;
        record.end_time = Some(Utc::now());
        record.stderr = failure.to_string();
        record.failure = Some(failure.clone());

        let mut entries = self.registry.lock().await;
        self.events.publish(
            request.id,
            ProcessEventKind::Failed {
                exit_code: None,
                failure,
                stdout: String::new(),
                stderr: record.stderr.clone(),
            },
        );
        entries.insert(request.id, ProcessEntry::new(record));
    }

    pub(crate) async fn append_output(&self, id: ProcessId, stream: OutputStream, data: String) {
        let mut entries = self.registry.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            trace!(process_id = %id, "dropping output for evicted process");
            return;
        };
        entry.record.append_output(stream, &data, self.output_limit);
        // Output drained after a kill is kept but no longer announced.
        if entry.record.status == ProcessStatus::Running {
            self.events
                .publish(id, ProcessEventKind::Output { stream, data });
        }
    }

    async fn on_timeout(&self, id: ProcessId, generation: u64) {
        let mut entries = self.registry.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        let armed = entry
            .timeout
            .as_ref()
            .is_some_and(|timer| timer.generation == generation);
        if !armed || !entry.record.is_active() {
            trace!(process_id = %id, generation, "ignoring stale timeout");
            return;
        }
        let timeout = entry
            .timeout
            .take()
            .map(TimeoutHandle::defuse)
            .unwrap_or_default();
        entry.record.mode = ProcessMode::Background;
        entry.demoted = true;
        self.slots.release(id);
        info!(
            process_id = %id,
            timeout_ms = timeout.as_millis() as u64,
            "active timeout elapsed; process moved to background"
        );
        self.events.publish(
            id,
            ProcessEventKind::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
        );
    }

    /// Moves the current active process to the background.
    pub(crate) async fn demote(&self, id: ProcessId) -> bool {
        let mut entries = self.registry.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        if !entry.record.is_active() {
            debug!(process_id = %id, "demote rejected: not the active process");
            return false;
        }
        entry.timeout = None;
        entry.record.mode = ProcessMode::Background;
        entry.demoted = true;
        self.slots.release(id);
        info!(process_id = %id, "process demoted to background");
        self.events.publish(
            id,
            ProcessEventKind::ModeChanged {
                from: ProcessMode::Active,
                to: ProcessMode::Background,
            },
        );
        true
    }

    /// Moves a background process into the active slot, waiting in the slot
    /// queue if another process holds it.
    pub(crate) async fn promote(&self, id: ProcessId) -> bool {
        let eligible = {
            let entries = self.registry.lock().await;
            entries
                .get(&id)
                .is_some_and(|entry| entry.record.is_background_running())
        };
        if !eligible {
            debug!(process_id = %id, "promote rejected: not a running background process");
            return false;
        }

        let grant = match self.slots.acquire(id).await {
            Ok(grant) => grant,
            Err(err) => {
                warn!(process_id = %id, "promote failed: {err}");
                return false;
            }
        };

        let mut entries = self.registry.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        if !entry.record.is_background_running() {
            debug!(
                process_id = %id,
                status = %entry.record.status,
                "process stopped while waiting for the active slot"
            );
            // Dropping the grant hands the slot to the next waiter.
            return false;
        }
        entry.record.mode = ProcessMode::Active;
        entry.demoted = false;
        grant.commit();
        info!(process_id = %id, "process promoted to active");
        self.events.publish(id, ProcessEventKind::Promoted);
        true
    }

    /// Terminates a running process: SIGTERM now, SIGKILL after the grace
    /// period if it is still alive. The record is marked killed immediately.
    pub(crate) async fn kill(&self, id: ProcessId) -> bool {
        let mut entries = self.registry.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        if entry.record.status != ProcessStatus::Running {
            return false;
        }
        let handle = entry.os_handle.take();
        self.finish(entry, ProcessStatus::Killed, None, None);
        info!(process_id = %id, "process killed");
        self.events.publish(
            id,
            ProcessEventKind::Killed {
                stdout: entry.record.stdout.clone(),
                stderr: entry.record.stderr.clone(),
            },
        );
        drop(entries);

        match handle {
            Some(handle) => handle.terminate(self.kill_grace),
            None => warn!(process_id = %id, "running process had no OS handle"),
        }
        true
    }

    pub(crate) async fn on_exit(&self, id: ProcessId, result: io::Result<ExitStatus>) {
        let mut entries = self.registry.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            debug!(process_id = %id, "exit reported for evicted process");
            return;
        };
        entry.os_handle = None;
        entry.record.pid = None;
        if entry.record.status != ProcessStatus::Running {
            debug!(process_id = %id, status = %entry.record.status, "process reaped");
            return;
        }

        let kind = match result {
            Ok(status) => {
                let exit_code = exit_code_of(&status);
                if exit_code == 0 {
                    self.finish(entry, ProcessStatus::Completed, Some(0), None);
                    info!(process_id = %id, "process completed");
                    ProcessEventKind::Completed {
                        exit_code,
                        stdout: entry.record.stdout.clone(),
                        stderr: entry.record.stderr.clone(),
                    }
                } else {
                    let failure = ProcessFailure::NonZeroExit { exit_code };
                    self.finish(
                        entry,
                        ProcessStatus::Failed,
                        Some(exit_code),
                        Some(failure.clone()),
                    );
                    info!(process_id = %id, exit_code, "process failed");
                    ProcessEventKind::Failed {
                        exit_code: Some(exit_code),
                        failure,
                        stdout: entry.record.stdout.clone(),
                        stderr: entry.record.stderr.clone(),
                    }
                }
            }
            Err(err) => {
                warn!(process_id = %id, "error while waiting for process: {err}");
                let failure = ProcessFailure::runtime(&err);
                self.finish(entry, ProcessStatus::Failed, None, Some(failure.clone()));
                ProcessEventKind::Failed {
                    exit_code: None,
                    failure,
                    stdout: entry.record.stdout.clone(),
                    stderr: entry.record.stderr.clone(),
                }
            }
        };
        self.events.publish(id, kind);
    }

    /// Common terminal transition: disarm the timer, drop the OS handle and
    /// give the slot back if this process held it.
    fn finish(
        &self,
        entry: &mut ProcessEntry,
        status: ProcessStatus,
        exit_code: Option<i32>,
        failure: Option<ProcessFailure>,
    ) {
        let held_slot = entry.record.is_active();
        entry.timeout = None;
        entry.os_handle = None;
        entry.record.pid = None;
        entry.record.status = status;
        entry.record.end_time = Some(Utc::now());
        entry.record.exit_code = exit_code;
        entry.record.failure = failure;
        if held_slot {
            self.slots.release(entry.record.id);
        }
    }

    /// Resolves once the process reaches a terminal state or is demoted out
    /// of the active slot. A process that has already been demoted resolves
    /// right away; one started in the background waits for its exit.
    /// `None` if the id is unknown (or evicted while waiting).
    pub(crate) async fn wait_for_completion(&self, id: ProcessId) -> Option<CompletionOutcome> {
        self.wait(id, true).await
    }

    /// Like [`Self::wait_for_completion`] but ignores demotions and only
    /// resolves on a terminal state.
    pub(crate) async fn wait_for_exit(&self, id: ProcessId) -> Option<CompletionOutcome> {
        self.wait(id, false).await
    }

    async fn wait(&self, id: ProcessId, stop_on_demotion: bool) -> Option<CompletionOutcome> {
        // Subscribe before reading the record so nothing slips in between.
        let mut events = self.events.subscribe_process(id);
        if let Some(outcome) = self.settled_outcome(id, stop_on_demotion).await? {
            return Some(outcome);
        }

        loop {
            let missed_before = events.missed();
            let event = events.recv().await;
            let lagged = events.missed() != missed_before;
            match &event {
                Some(event) if !lagged && stop_on_demotion && event.kind.is_demotion() => {
                    // The process may have been promoted again since; the
                    // demotion event itself is what releases the waiter.
                    let entries = self.registry.lock().await;
                    let record = &entries.get(&id)?.record;
                    return Some(if record.status.is_terminal() {
                        CompletionOutcome::finished(record)
                    } else {
                        CompletionOutcome::demoted(record)
                    });
                }
                Some(event) if !lagged && !event.kind.is_terminal() => continue,
                _ => {}
            }

            if let Some(outcome) = self.settled_outcome(id, stop_on_demotion).await? {
                return Some(outcome);
            }
            if event.is_none() {
                // Bus closed; nothing more will ever arrive.
                let entries = self.registry.lock().await;
                return Some(CompletionOutcome::demoted(&entries.get(&id)?.record));
            }
        }
    }

    /// `Some(Some(_))` once the record is terminal (or has been demoted, when
    /// `demotion_settles`), `Some(None)` while a waiter should keep listening,
    /// `None` if it is gone.
    async fn settled_outcome(
        &self,
        id: ProcessId,
        demotion_settles: bool,
    ) -> Option<Option<CompletionOutcome>> {
        let entries = self.registry.lock().await;
        let entry = entries.get(&id)?;
        let record = &entry.record;
        Some(if record.status.is_terminal() {
            Some(CompletionOutcome::finished(record))
        } else if demotion_settles && entry.demoted && record.mode == ProcessMode::Background {
            Some(CompletionOutcome::demoted(record))
        } else {
            None
        })
    }
}
