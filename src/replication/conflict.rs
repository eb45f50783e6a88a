//! Conflict Serialization Queue
//!
//! Per-file admission control: one active group of operations per file,
//! with conflicting arrivals queued FIFO until the active group drains.
//! Every concurrent mutation on a file is treated as conflicting; the
//! coarse policy trades concurrency for simplicity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::protocol::FileId;

/// Identifier of one in-flight operation, for active-set bookkeeping
pub type OpId = u64;

/// Outcome of an admission attempt
pub enum Admission {
    /// Caller proceeds immediately
    Active,
    /// Caller must await the receiver; it resolves when `release` grants
    /// the slot
    Queued(oneshot::Receiver<()>),
}

/// A queued operation waiting for the active group to drain
struct Waiter {
    op_id: OpId,
    resume: oneshot::Sender<()>,
}

/// Per-file conflict state. Created lazily on first access and retained
/// for the file's lifetime.
#[derive(Default)]
struct FileConflictState {
    /// Operations currently running against this file
    active_count: usize,
    /// Operations waiting because `active_count > 0`
    pending: VecDeque<Waiter>,
    /// Currently-active members, kept for future conflict-precision work
    active: Vec<OpId>,
}

/// Map from file identity to its conflict state.
///
/// Both locks are held only for O(1) bookkeeping, never across a replica
/// round-trip.
#[derive(Default)]
pub struct ConflictTable {
    files: Mutex<HashMap<FileId, Arc<Mutex<FileConflictState>>>>,
}

impl ConflictTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_for(&self, file: &FileId) -> Arc<Mutex<FileConflictState>> {
        let mut files = self.files.lock().unwrap();
        files.entry(*file).or_default().clone()
    }

    /// Try to admit `op_id` against `file`. Returns `Active` when no
    /// group is in flight, otherwise queues the operation FIFO.
    pub fn admit(&self, file: &FileId, op_id: OpId) -> Admission {
        let state = self.state_for(file);
        let mut state = state.lock().unwrap();

        if state.active_count == 0 {
            state.active_count = 1;
            state.active.push(op_id);
            Admission::Active
        } else {
            let (tx, rx) = oneshot::channel();
            state.pending.push_back(Waiter { op_id, resume: tx });
            tracing::debug!(%file, op_id, queued = state.pending.len(), "operation queued");
            Admission::Queued(rx)
        }
    }

    /// Release the slot held by `op_id`. The head of the pending queue,
    /// if any, is moved to the active set and resumed; this is the only
    /// place queued operations make progress.
    pub fn release(&self, file: &FileId, op_id: OpId) {
        let state = self.state_for(file);
        let mut state = state.lock().unwrap();

        state.active.retain(|id| *id != op_id);

        while let Some(waiter) = state.pending.pop_front() {
            state.active.push(waiter.op_id);
            if waiter.resume.send(()).is_ok() {
                // Slot transfers to the waiter; active_count unchanged
                return;
            }
            // Waiter dropped its receiver (caller gone); grant the next
            state.active.pop();
        }

        state.active_count -= 1;
    }

    /// Number of operations currently active against `file`
    pub fn active_count(&self, file: &FileId) -> usize {
        let files = self.files.lock().unwrap();
        files
            .get(file)
            .map(|s| s.lock().unwrap().active_count)
            .unwrap_or(0)
    }

    /// Number of operations queued against `file`
    pub fn pending_count(&self, file: &FileId) -> usize {
        let files = self.files.lock().unwrap();
        files
            .get(file)
            .map(|s| s.lock().unwrap().pending.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[test]
    fn test_first_admission_is_active() {
        let table = ConflictTable::new();
        let file = Uuid::new_v4();

        assert!(matches!(table.admit(&file, 1), Admission::Active));
        assert_eq!(table.active_count(&file), 1);
    }

    #[test]
    fn test_conflicting_admission_is_queued() {
        let table = ConflictTable::new();
        let file = Uuid::new_v4();

        assert!(matches!(table.admit(&file, 1), Admission::Active));
        assert!(matches!(table.admit(&file, 2), Admission::Queued(_)));
        assert_eq!(table.active_count(&file), 1);
        assert_eq!(table.pending_count(&file), 1);
    }

    #[test]
    fn test_independent_files_do_not_conflict() {
        let table = ConflictTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(matches!(table.admit(&a, 1), Admission::Active));
        assert!(matches!(table.admit(&b, 2), Admission::Active));
    }

    #[tokio::test]
    async fn test_release_resumes_head_in_fifo_order() {
        let table = ConflictTable::new();
        let file = Uuid::new_v4();

        assert!(matches!(table.admit(&file, 1), Admission::Active));
        let rx2 = match table.admit(&file, 2) {
            Admission::Queued(rx) => rx,
            _ => panic!("expected queued"),
        };
        let rx3 = match table.admit(&file, 3) {
            Admission::Queued(rx) => rx,
            _ => panic!("expected queued"),
        };

        table.release(&file, 1);
        rx2.await.unwrap();
        // Third waiter still pending; the slot went to the head
        assert_eq!(table.pending_count(&file), 1);

        table.release(&file, 2);
        rx3.await.unwrap();

        table.release(&file, 3);
        assert_eq!(table.active_count(&file), 0);
    }

    #[tokio::test]
    async fn test_admissions_complete_in_order() {
        let table = Arc::new(ConflictTable::new());
        let file = Uuid::new_v4();
        let completions = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for op_id in 0..8u64 {
            // Admit in submission order on the current task, then hand
            // the wait to a spawned task
            let admission = table.admit(&file, op_id);
            let table = table.clone();
            let completions = completions.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                if let Admission::Queued(rx) = admission {
                    rx.await.unwrap();
                }
                // At most one operation may hold the slot at a time
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                completions.lock().unwrap().push(op_id);
                table.release(&file, op_id);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let order = completions.lock().unwrap().clone();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_waiter_skipped_on_release() {
        let table = ConflictTable::new();
        let file = Uuid::new_v4();

        assert!(matches!(table.admit(&file, 1), Admission::Active));
        let rx2 = match table.admit(&file, 2) {
            Admission::Queued(rx) => rx,
            _ => panic!("expected queued"),
        };
        let rx3 = match table.admit(&file, 3) {
            Admission::Queued(rx) => rx,
            _ => panic!("expected queued"),
        };

        drop(rx2);
        table.release(&file, 1);

        // Slot skipped the dropped waiter and reached the third
        let mut rx3 = rx3;
        assert!(rx3.try_recv().is_ok());
    }
}
