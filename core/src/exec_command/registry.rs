use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;

use super::lifecycle::TimeoutHandle;
use super::process_id::ProcessId;
use super::record::ProcessRecord;
use super::record::ProcessSnapshot;
use super::spawner::OsHandle;

/// A record plus the resources that only live while it is running.
#[derive(Debug)]
pub(crate) struct ProcessEntry {
    pub(crate) record: ProcessRecord,
    /// Present iff `record.status` is running.
    pub(crate) os_handle: Option<OsHandle>,
    /// Present iff the record is active, running and was started with a
    /// finite timeout. Dropping it disarms the timer.
    pub(crate) timeout: Option<TimeoutHandle>,
    /// Set when the process left the active slot by timeout or manual demote,
    /// cleared again on promote. A background-from-start record never sets it.
    pub(crate) demoted: bool,
}

impl ProcessEntry {
    pub(crate) fn new(record: ProcessRecord) -> Self {
        Self {
            record,
            os_handle: None,
            timeout: None,
            demoted: false,
        }
    }
}

pub(crate) type Entries = HashMap<ProcessId, ProcessEntry>;

/// In-memory store of process entries. Holds no policy: every state decision
/// is made by the lifecycle controller while it holds [`ProcessRegistry::lock`].
#[derive(Debug, Clone, Default)]
pub(crate) struct ProcessRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl ProcessRegistry {
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().await
    }

    pub(crate) async fn get(&self, id: ProcessId) -> Option<ProcessSnapshot> {
        let entries = self.entries.lock().await;
        entries.get(&id).map(|entry| entry.record.snapshot())
    }

    /// All records, oldest first.
    pub(crate) async fn list(&self) -> Vec<ProcessSnapshot> {
        let mut snapshots = {
            let entries = self.entries.lock().await;
            entries
                .values()
                .map(|entry| entry.record.snapshot())
                .collect::<Vec<_>>()
        };
        snapshots.sort_by(|a, b| {
            a.record
                .start_time
                .cmp(&b.record.start_time)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        snapshots
    }

    #[cfg(test)]
    pub(crate) async fn upsert(&self, entry: ProcessEntry) -> Option<ProcessEntry> {
        let mut entries = self.entries.lock().await;
        entries.insert(entry.record.id, entry)
    }

    #[cfg(test)]
    pub(crate) async fn evict(&self, id: ProcessId) -> Option<ProcessRecord> {
        let mut entries = self.entries.lock().await;
        entries.remove(&id).map(|entry| entry.record)
    }

    /// Drops terminal records whose end time is more than `age` in the past.
    pub(crate) async fn evict_terminal_older_than(&self, age: Duration) -> Vec<ProcessId> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(age);
        let mut evicted = Vec::new();
        let mut entries = self.entries.lock().await;
        entries.retain(|id, entry| {
            let expired = entry.record.status.is_terminal()
                && match (entry.record.end_time, cutoff) {
                    (Some(end), Some(cutoff)) => end <= cutoff,
                    _ => false,
                };
            if expired {
                evicted.push(*id);
            }
            !expired
        });
        evicted
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
