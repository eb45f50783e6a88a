//! Durability Batcher
//!
//! Replicated writes leave dirty markers on their open handle instead of
//! forcing each write durable individually. Markers are drained either
//! by an explicit durability request or by a background flush that runs
//! on a fixed interval and syncs every dirtied handle in one pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;

use crate::error::Result;
use crate::replication::protocol::{FileId, OpMeta, ReplicaSet};
use crate::state::QuorumTracker;

/// Open-handle identifier
pub type HandleId = u64;

/// An open file handle tracked by the durability layer
pub struct OpenHandle {
    /// Handle identifier
    pub id: HandleId,
    /// File the handle refers to
    pub file: FileId,
    /// Pending write markers not yet forced durable
    markers: Mutex<Vec<OpMeta>>,
}

impl OpenHandle {
    pub fn new(id: HandleId, file: FileId) -> Arc<Self> {
        Arc::new(Self {
            id,
            file,
            markers: Mutex::new(Vec::new()),
        })
    }

    /// Count of markers awaiting durability
    pub fn pending_markers(&self) -> usize {
        self.markers.lock().unwrap().len()
    }
}

/// Accumulates dirty handles and forces them durable in batches.
///
/// While a handle has pending markers the batcher holds an owning
/// reference to it in the global dirty set, keeping the handle alive
/// until its markers drain.
pub struct DurabilityBatcher {
    replicas: Arc<ReplicaSet>,
    quorum: Arc<QuorumTracker>,
    /// Global dirty-handle set; the lock is held only for insert/remove
    /// and the atomic swap, never during flush work
    dirty: Mutex<HashMap<HandleId, Arc<OpenHandle>>>,
}

impl DurabilityBatcher {
    pub fn new(replicas: Arc<ReplicaSet>, quorum: Arc<QuorumTracker>) -> Self {
        Self {
            replicas,
            quorum,
            dirty: Mutex::new(HashMap::new()),
        }
    }

    /// Record a write marker against `handle`. The handle's first
    /// pending marker inserts it into the global dirty set.
    pub fn mark_dirty(&self, handle: &Arc<OpenHandle>, meta: OpMeta) {
        let was_clean = {
            let mut markers = handle.markers.lock().unwrap();
            let was_clean = markers.is_empty();
            markers.push(meta);
            was_clean
        };

        if was_clean {
            self.dirty
                .lock()
                .unwrap()
                .insert(handle.id, Arc::clone(handle));
        }
    }

    /// Number of handles currently in the global dirty set
    pub fn dirty_handles(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }

    /// Explicit durability request for one handle.
    ///
    /// On a leader the flush goes to every replica in parallel and waits
    /// for all of them; durability requests are unconditional and never
    /// quorum-gated. On a follower only the local replica is flushed.
    /// Either way the handle's marker list drains.
    pub async fn explicit_flush(&self, handle: &Arc<OpenHandle>) -> Result<()> {
        // Swap first, fsync second: the dirty entry and the markers are
        // taken before the flush is issued, so a marker arriving while
        // the fsync is in flight finds an empty list and re-registers
        // the handle instead of being drained by a flush that does not
        // cover it.
        self.dirty.lock().unwrap().remove(&handle.id);
        let drained = std::mem::take(&mut *handle.markers.lock().unwrap());
        tracing::debug!(
            handle = handle.id,
            file = %handle.file,
            markers = drained.len(),
            "explicit flush draining markers"
        );

        if self.quorum.is_leader() {
            let flushes = self
                .replicas
                .iter()
                .map(|replica| replica.flush(handle.file));
            join_all(flushes)
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()
                .map(|_| ())
        } else {
            self.replicas.local().flush(handle.file).await
        }
    }

    /// One background flush pass: atomically swap out the dirty set,
    /// then force each handle durable locally and drop its owning
    /// reference. A handle dirtied again mid-flush lands on the fresh
    /// set exactly as if newly dirtied.
    pub async fn periodic_flush(&self) {
        let batch = std::mem::take(&mut *self.dirty.lock().unwrap());
        if batch.is_empty() {
            return;
        }

        tracing::debug!(handles = batch.len(), "periodic durability flush");

        for handle in batch.into_values() {
            let drained = std::mem::take(&mut *handle.markers.lock().unwrap());
            if let Err(e) = self.replicas.local().flush(handle.file).await {
                tracing::warn!(
                    handle = handle.id,
                    file = %handle.file,
                    markers = drained.len(),
                    error = %e,
                    "periodic flush failed"
                );
            }
            // Owning reference dropped here; the handle stays alive only
            // through its other owners
        }
    }

    /// Run the background flush loop on a fixed wake interval
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.periodic_flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::{Message, Operation, Replica, ReplicaReply};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingReplica {
        name: String,
        flushes: AtomicUsize,
    }

    impl CountingReplica {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                flushes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Replica for CountingReplica {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, _meta: OpMeta, _op: &Operation) -> Result<ReplicaReply> {
            Ok(ReplicaReply::ok(0))
        }

        async fn send_control(&self, _msg: &Message) -> Result<()> {
            Ok(())
        }

        async fn flush(&self, _target: FileId) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_meta(index: u64) -> OpMeta {
        OpMeta {
            term: 1,
            index,
            from_leader: false,
            reconciling: false,
        }
    }

    fn setup(leader: bool) -> (Arc<ReplicaSet>, Vec<Arc<CountingReplica>>, DurabilityBatcher) {
        let replicas: Vec<Arc<CountingReplica>> = vec![
            CountingReplica::new("local"),
            CountingReplica::new("peer-1"),
            CountingReplica::new("peer-2"),
        ];
        let set = Arc::new(
            ReplicaSet::new(replicas.iter().map(|r| r.clone() as Arc<dyn Replica>).collect())
                .unwrap(),
        );
        let quorum = Arc::new(QuorumTracker::new(3, 50.0, Some(leader)));
        let batcher = DurabilityBatcher::new(Arc::clone(&set), quorum);
        (set, replicas, batcher)
    }

    #[tokio::test]
    async fn test_first_marker_inserts_into_dirty_set() {
        let (_set, _replicas, batcher) = setup(true);
        let handle = OpenHandle::new(7, Uuid::new_v4());

        assert_eq!(batcher.dirty_handles(), 0);
        batcher.mark_dirty(&handle, test_meta(1));
        batcher.mark_dirty(&handle, test_meta(2));
        assert_eq!(batcher.dirty_handles(), 1);
        assert_eq!(handle.pending_markers(), 2);
    }

    #[tokio::test]
    async fn test_explicit_flush_on_leader_hits_all_replicas() {
        let (_set, replicas, batcher) = setup(true);
        let handle = OpenHandle::new(1, Uuid::new_v4());

        batcher.mark_dirty(&handle, test_meta(1));
        batcher.explicit_flush(&handle).await.unwrap();

        for replica in &replicas {
            assert_eq!(replica.flushes.load(Ordering::SeqCst), 1);
        }
        assert_eq!(handle.pending_markers(), 0);
        assert_eq!(batcher.dirty_handles(), 0);
    }

    #[tokio::test]
    async fn test_explicit_flush_on_follower_is_local_only() {
        let (_set, replicas, batcher) = setup(false);
        let handle = OpenHandle::new(1, Uuid::new_v4());

        batcher.mark_dirty(&handle, test_meta(1));
        batcher.explicit_flush(&handle).await.unwrap();

        assert_eq!(replicas[0].flushes.load(Ordering::SeqCst), 1);
        assert_eq!(replicas[1].flushes.load(Ordering::SeqCst), 0);
        assert_eq!(replicas[2].flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_marker_drained_by_exactly_one_flush() {
        let (_set, replicas, batcher) = setup(true);
        let handle = OpenHandle::new(1, Uuid::new_v4());

        batcher.mark_dirty(&handle, test_meta(1));
        batcher.periodic_flush().await;
        assert_eq!(handle.pending_markers(), 0);
        assert_eq!(batcher.dirty_handles(), 0);
        assert_eq!(replicas[0].flushes.load(Ordering::SeqCst), 1);

        // A second pass finds nothing to do
        batcher.periodic_flush().await;
        assert_eq!(replicas[0].flushes.load(Ordering::SeqCst), 1);
    }

    /// Replica whose fsync blocks until the test grants a permit
    struct GatedReplica {
        name: String,
        flushes: AtomicUsize,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl Replica for GatedReplica {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, _meta: OpMeta, _op: &Operation) -> Result<ReplicaReply> {
            Ok(ReplicaReply::ok(0))
        }

        async fn send_control(&self, _msg: &Message) -> Result<()> {
            Ok(())
        }

        async fn flush(&self, _target: FileId) -> Result<()> {
            self.gate.acquire().await.map_err(|_| crate::Error::Internal("gate closed".into()))?.forget();
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_marker_added_mid_flush_is_not_dropped() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let replicas: Vec<Arc<GatedReplica>> = ["local", "peer-1", "peer-2"]
            .iter()
            .map(|name| {
                Arc::new(GatedReplica {
                    name: name.to_string(),
                    flushes: AtomicUsize::new(0),
                    gate: Arc::clone(&gate),
                })
            })
            .collect();
        let set = Arc::new(
            ReplicaSet::new(replicas.iter().map(|r| r.clone() as Arc<dyn Replica>).collect())
                .unwrap(),
        );
        let quorum = Arc::new(QuorumTracker::new(3, 50.0, Some(true)));
        let batcher = Arc::new(DurabilityBatcher::new(set, quorum));
        let handle = OpenHandle::new(1, Uuid::new_v4());

        batcher.mark_dirty(&handle, test_meta(1));

        let task = {
            let batcher = Arc::clone(&batcher);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { batcher.explicit_flush(&handle).await })
        };

        // Wait until the flush has taken the markers and is blocked in
        // the fsync round-trip
        while handle.pending_markers() != 0 {
            tokio::task::yield_now().await;
        }

        // A write lands while the fsync is in flight; the in-flight
        // flush does not cover it
        batcher.mark_dirty(&handle, test_meta(2));

        gate.add_permits(3);
        task.await.unwrap().unwrap();

        // The mid-flight marker survived and the handle is registered
        assert_eq!(handle.pending_markers(), 1);
        assert_eq!(batcher.dirty_handles(), 1);

        // The next background pass fsyncs it
        gate.add_permits(1);
        batcher.periodic_flush().await;
        assert_eq!(handle.pending_markers(), 0);
        assert_eq!(batcher.dirty_handles(), 0);
        assert_eq!(replicas[0].flushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_redirty_after_periodic_flush() {
        let (_set, _replicas, batcher) = setup(true);
        let handle = OpenHandle::new(1, Uuid::new_v4());

        batcher.mark_dirty(&handle, test_meta(1));
        batcher.periodic_flush().await;

        // Dirtying again re-inserts into the fresh set
        batcher.mark_dirty(&handle, test_meta(2));
        assert_eq!(batcher.dirty_handles(), 1);
        assert_eq!(handle.pending_markers(), 1);
    }
}
