//! The single active slot and its FIFO wait queue.
//!
//! All decisions run inside one actor task that drains a command channel in
//! order, so "is the slot free" and "claim it" can never interleave with
//! another caller.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use super::errors::ProcessError;
use super::process_id::ProcessId;

#[derive(Debug)]
enum SlotCommand {
    Acquire {
        holder: ProcessId,
        reply: oneshot::Sender<SlotGrant>,
    },
    Release {
        holder: ProcessId,
        reply: Option<oneshot::Sender<bool>>,
    },
    Inspect {
        reply: oneshot::Sender<SlotState>,
    },
}

/// Observable allocator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub holder: Option<ProcessId>,
    pub queued: Vec<ProcessId>,
}

#[derive(Debug, Clone)]
pub struct SlotAllocator {
    tx: mpsc::UnboundedSender<SlotCommand>,
}

impl SlotAllocator {
    /// Starts the allocator actor on the current tokio runtime. The actor
    /// stops once every handle and outstanding grant is dropped.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_allocator(rx, tx.downgrade()));
        Self { tx }
    }

    /// Places `holder` in line for the slot. The request keeps its position
    /// from this call on, even before the returned future is polled.
    pub fn request(&self, holder: ProcessId) -> Result<PendingGrant, ProcessError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SlotCommand::Acquire { holder, reply })
            .map_err(|_| ProcessError::AllocatorClosed)?;
        Ok(PendingGrant { holder, rx })
    }

    pub async fn acquire(&self, holder: ProcessId) -> Result<SlotGrant, ProcessError> {
        self.request(holder)?.granted().await
    }

    /// Frees the slot if `holder` owns it; anything else is a no-op.
    pub fn release(&self, holder: ProcessId) {
        let _ = self.tx.send(SlotCommand::Release {
            holder,
            reply: None,
        });
    }

    /// Like [`SlotAllocator::release`] but reports whether `holder` actually
    /// owned the slot.
    pub async fn release_confirmed(&self, holder: ProcessId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SlotCommand::Release {
                holder,
                reply: Some(reply),
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn state(&self) -> Result<SlotState, ProcessError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SlotCommand::Inspect { reply })
            .map_err(|_| ProcessError::AllocatorClosed)?;
        rx.await.map_err(|_| ProcessError::AllocatorClosed)
    }

    pub async fn holder(&self) -> Option<ProcessId> {
        self.state().await.ok().and_then(|state| state.holder)
    }

    pub async fn queue_len(&self) -> usize {
        self.state().await.map_or(0, |state| state.queued.len())
    }
}

/// A queued request. Dropping it withdraws the request: when its turn comes
/// the allocator skips it and moves on to the next waiter.
#[derive(Debug)]
pub struct PendingGrant {
    holder: ProcessId,
    rx: oneshot::Receiver<SlotGrant>,
}

impl PendingGrant {
    pub fn holder(&self) -> ProcessId {
        self.holder
    }

    pub async fn granted(self) -> Result<SlotGrant, ProcessError> {
        self.rx.await.map_err(|_| ProcessError::AllocatorClosed)
    }
}

/// Ownership of the active slot. Until [`SlotGrant::commit`] is called,
/// dropping the grant hands the slot straight back to the allocator.
#[must_use = "dropping a SlotGrant releases the active slot"]
#[derive(Debug)]
pub struct SlotGrant {
    holder: ProcessId,
    tx: Option<mpsc::UnboundedSender<SlotCommand>>,
}

impl SlotGrant {
    pub fn holder(&self) -> ProcessId {
        self.holder
    }

    /// Keeps the slot after the grant goes away. The holder must later give
    /// it back with [`SlotAllocator::release`].
    pub fn commit(mut self) {
        self.tx = None;
    }
}

impl Drop for SlotGrant {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(SlotCommand::Release {
                holder: self.holder,
                reply: None,
            });
        }
    }
}

struct QueueEntry {
    holder: ProcessId,
    reply: oneshot::Sender<SlotGrant>,
    enqueued_at: Instant,
}

struct Allocator {
    holder: Option<ProcessId>,
    queue: VecDeque<QueueEntry>,
    tx: mpsc::WeakUnboundedSender<SlotCommand>,
}

impl Allocator {
    fn handle(&mut self, command: SlotCommand) {
        match command {
            SlotCommand::Acquire { holder, reply } => {
                let entry = QueueEntry {
                    holder,
                    reply,
                    enqueued_at: Instant::now(),
                };
                if self.holder.is_none() {
                    self.grant(entry);
                } else {
                    debug!(
                        process_id = %holder,
                        position = self.queue.len() + 1,
                        "active slot busy; request queued"
                    );
                    self.queue.push_back(entry);
                }
            }
            SlotCommand::Release { holder, reply } => {
                let released = self.release(holder);
                if let Some(reply) = reply {
                    let _ = reply.send(released);
                }
            }
            SlotCommand::Inspect { reply } => {
                let _ = reply.send(SlotState {
                    holder: self.holder,
                    queued: self.queue.iter().map(|entry| entry.holder).collect(),
                });
            }
        }
    }

    fn release(&mut self, holder: ProcessId) -> bool {
        if self.holder != Some(holder) {
            trace!(process_id = %holder, "ignoring release from non-holder");
            return false;
        }
        self.holder = None;
        debug!(process_id = %holder, "active slot released");
        while let Some(entry) = self.queue.pop_front() {
            if self.grant(entry) {
                break;
            }
        }
        true
    }

    /// Hands the slot to `entry`. Returns false when the waiter has gone away,
    /// leaving the slot free.
    fn grant(&mut self, entry: QueueEntry) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        let QueueEntry {
            holder,
            reply,
            enqueued_at,
        } = entry;
        self.holder = Some(holder);
        let grant = SlotGrant {
            holder,
            tx: Some(tx),
        };
        match reply.send(grant) {
            Ok(()) => {
                debug!(
                    process_id = %holder,
                    waited_ms = enqueued_at.elapsed().as_millis() as u64,
                    "active slot granted"
                );
                true
            }
            Err(grant) => {
                grant.commit();
                self.holder = None;
                debug!(process_id = %holder, "skipping withdrawn slot request");
                false
            }
        }
    }
}

async fn run_allocator(
    mut rx: mpsc::UnboundedReceiver<SlotCommand>,
    tx: mpsc::WeakUnboundedSender<SlotCommand>,
) {
    let mut allocator = Allocator {
        holder: None,
        queue: VecDeque::new(),
        tx,
    };
    while let Some(command) = rx.recv().await {
        allocator.handle(command);
    }
    trace!("slot allocator stopped");
}
