//! Fan-out/Fan-in Replication Engine
//!
//! One generic engine drives every mutating operation kind through the
//! same protocol: admit against the per-file conflict queue, fan the
//! operation out to every remote replica, aggregate the replies, attempt
//! the operation locally, and accept or roll back on the final quorum
//! decision. The stages (dispatch, fan-in, continue, complete) are
//! explicit methods over an owned per-operation context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;

use crate::durability::{DurabilityBatcher, OpenHandle};
use crate::error::{Error, Result};
use crate::journal::TermWriter;
use crate::state::{AvailabilityEvent, QuorumTracker};

use super::conflict::{Admission, ConflictTable, OpId};
use super::protocol::{FopKind, Message, OpMeta, Operation, ReplicaReply, ReplicaSet};
use super::rollback::RollbackCoordinator;

/// Per in-flight call state, created on entry to a mutating call and
/// destroyed once the final result is produced
struct OpContext {
    op_id: OpId,
    meta: OpMeta,
    op: Operation,
    /// Open handle receiving the durability marker for write-class ops
    handle: Option<Arc<OpenHandle>>,
    /// Remote successes observed during fan-in
    successful_acks: usize,
    /// Return value to surface if quorum succeeds despite a local failure
    successful_op_ret: i64,
}

/// Term and index assignment for journal correlation
struct MetaCounter {
    term: u64,
    next_index: u64,
}

/// Coordinates replicated mutations across the replica set
pub struct ReplicationEngine {
    replicas: Arc<ReplicaSet>,
    quorum: Arc<QuorumTracker>,
    conflicts: ConflictTable,
    rollback: RollbackCoordinator,
    durability: Arc<DurabilityBatcher>,
    counter: Mutex<MetaCounter>,
    next_op_id: AtomicU64,
    /// Term journal written on behalf of inbound frames; absent until
    /// the embedding service attaches one
    journal: Mutex<Option<TermWriter>>,
}

impl ReplicationEngine {
    pub fn new(
        replicas: Arc<ReplicaSet>,
        quorum: Arc<QuorumTracker>,
        durability: Arc<DurabilityBatcher>,
    ) -> Self {
        let rollback = RollbackCoordinator::new(Arc::clone(&replicas));
        Self {
            replicas,
            quorum,
            conflicts: ConflictTable::new(),
            rollback,
            durability,
            counter: Mutex::new(MetaCounter {
                term: 1,
                next_index: 1,
            }),
            next_op_id: AtomicU64::new(1),
            journal: Mutex::new(None),
        }
    }

    /// Attach the term journal that inbound operations and rollback
    /// signals are recorded to
    pub fn attach_journal(&self, writer: TermWriter) {
        *self.journal.lock().unwrap() = Some(writer);
    }

    /// Inbound liveness notification: replica `index` came up
    pub fn child_up(&self, index: usize) -> Option<AvailabilityEvent> {
        self.quorum.child_up(index)
    }

    /// Inbound liveness notification: replica `index` went down
    pub fn child_down(&self, index: usize) -> Option<AvailabilityEvent> {
        self.quorum.child_down(index)
    }

    /// Current journal term
    pub fn current_term(&self) -> u64 {
        self.counter.lock().unwrap().term
    }

    /// Advance to a new journal term; indices restart at 1
    pub fn change_term(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap();
        counter.term += 1;
        counter.next_index = 1;
        tracing::info!(term = counter.term, "journal term changed");
        counter.term
    }

    fn next_meta(&self) -> OpMeta {
        let mut counter = self.counter.lock().unwrap();
        let meta = OpMeta {
            term: counter.term,
            index: counter.next_index,
            from_leader: true,
            reconciling: false,
        };
        counter.next_index += 1;
        meta
    }

    /// Entry point for a client mutating call against this replica.
    ///
    /// Only the leader coordinates; a follower rejects immediately with
    /// `NotLeader` (the client must retry against the leader). For
    /// write-class operations `handle` receives the durability marker.
    pub async fn submit(&self, op: Operation, handle: Option<&Arc<OpenHandle>>) -> Result<i64> {
        if !self.quorum.is_leader() {
            return Err(Error::NotLeader);
        }

        // Durability requests are unconditional and never quorum-gated;
        // they go through the durability batcher, not the fan-out path
        if op.kind() == FopKind::Fsync {
            return Err(Error::Replication(
                "fsync is not quorum-replicated; flush through the durability batcher".into(),
            ));
        }

        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);

        // Conflict admission: at most one group of operations per file
        match self.conflicts.admit(&op.target, op_id) {
            Admission::Active => {}
            Admission::Queued(rx) => {
                rx.await
                    .map_err(|_| Error::AllocationFailure("conflict slot lost".into()))?;
            }
        }

        let mut ctx = OpContext {
            op_id,
            meta: self.next_meta(),
            op,
            handle: handle.cloned(),
            successful_acks: 0,
            successful_op_ret: -1,
        };

        // Admission pre-check: with too few peers up the operation
        // cannot reach quorum no matter what the replicas answer
        if !self.quorum.pre_check() {
            let reached = self.quorum.up_peers();
            self.fail_before_local(&ctx, reached).await;
            self.conflicts.release(&ctx.op.target, ctx.op_id);
            return Err(Error::QuorumNotMet {
                reached,
                possible: self.replicas.len() - 1,
            });
        }

        self.dispatch(&mut ctx).await;
        self.continue_op(ctx).await
    }

    /// Entry point for a call arriving over the replica transport. Calls
    /// carrying a from-leader or reconciliation marker are applied
    /// locally and answered directly; anything else is rejected.
    pub async fn apply_remote(&self, meta: OpMeta, op: Operation) -> Result<ReplicaReply> {
        if !meta.from_leader && !meta.reconciling {
            return Err(Error::NotLeader);
        }

        self.replicas.local().send(meta, &op).await
    }

    /// Dispatch one decoded frame from the replica transport. Returns
    /// the reply frame to send back, if the message calls for one.
    pub async fn handle_message(&self, msg: Message) -> Result<Option<Message>> {
        match msg {
            Message::Fop { meta, op } => {
                if let Some(journal) = self.journal.lock().unwrap().as_mut() {
                    journal.append_op(meta, &op, &[])?;
                }
                let reply = self.apply_remote(meta, op).await?;
                Ok(Some(Message::FopReply {
                    term: meta.term,
                    index: meta.index,
                    reply,
                }))
            }
            Message::Rollback {
                meta,
                failed_kind,
                target,
            } => {
                tracing::warn!(
                    term = meta.term,
                    index = meta.index,
                    ?failed_kind,
                    "received rollback signal"
                );
                match self.journal.lock().unwrap().as_mut() {
                    Some(journal) => journal.append_rollback(meta, failed_kind, target)?,
                    None => tracing::warn!(
                        term = meta.term,
                        index = meta.index,
                        "no term journal attached, rollback signal not recorded"
                    ),
                }
                Ok(None)
            }
            Message::Flush { target } => {
                self.replicas.local().flush(target).await?;
                Ok(None)
            }
            Message::FopReply { .. } => Err(Error::Replication(
                "unexpected inbound FopReply frame".into(),
            )),
        }
    }

    /// Dispatch stage: send to every remote replica concurrently and
    /// collect the fan-in. All sends are issued before any reply is
    /// awaited; no lock is held across the round-trip.
    async fn dispatch(&self, ctx: &mut OpContext) {
        let remotes = self.replicas.remotes();
        let mut call_count = remotes.len();
        tracing::debug!(
            term = ctx.meta.term,
            index = ctx.meta.index,
            kind = ?ctx.op.kind(),
            call_count,
            "fan-out"
        );

        let replies = join_all(
            remotes
                .iter()
                .map(|replica| replica.send(ctx.meta, &ctx.op)),
        )
        .await;

        for (replica, reply) in remotes.iter().zip(replies) {
            call_count -= 1;
            match reply {
                Ok(reply) if reply.success => {
                    ctx.successful_acks += 1;
                    ctx.successful_op_ret = reply.op_ret;
                }
                Ok(reply) => {
                    tracing::debug!(
                        replica = replica.name(),
                        op_errno = reply.op_errno,
                        "remote replica rejected operation"
                    );
                }
                Err(e) => {
                    tracing::debug!(replica = replica.name(), error = %e, "remote send failed");
                }
            }
        }
        debug_assert_eq!(call_count, 0);
    }

    /// Continue stage: re-evaluate quorum with the local result counted
    /// optimistically; fail fast without a local attempt when quorum is
    /// already unreachable, otherwise attempt locally and complete.
    async fn continue_op(&self, ctx: OpContext) -> Result<i64> {
        let total = self.replicas.len();
        let optimistic = ctx.successful_acks + 1;

        if !self.quorum.post_check(optimistic) {
            self.fail_before_local(&ctx, ctx.successful_acks).await;
            self.conflicts.release(&ctx.op.target, ctx.op_id);
            return Err(Error::QuorumNotMet {
                reached: optimistic,
                possible: total,
            });
        }

        let local_reply = self.replicas.local().send(ctx.meta, &ctx.op).await;
        self.complete_op(ctx, local_reply).await
    }

    /// Complete stage: fold in the local outcome, release the conflict
    /// slot, hand write-class markers to the durability batcher, and make
    /// the final quorum decision.
    ///
    /// A local failure masked by remote quorum is reported as success;
    /// the leader's own copy is NOT repaired inline — reconciliation of
    /// the divergent local state is deferred to the journal-driven
    /// recovery pass, which is a documented consistency caveat.
    async fn complete_op(&self, ctx: OpContext, local_reply: Result<ReplicaReply>) -> Result<i64> {
        let (local_ok, local_ret) = match &local_reply {
            Ok(reply) if reply.success => (true, reply.op_ret),
            Ok(reply) => {
                tracing::debug!(op_errno = reply.op_errno, "local attempt failed");
                (false, -1)
            }
            Err(e) => {
                tracing::debug!(error = %e, "local attempt failed");
                (false, -1)
            }
        };

        let final_acks = ctx.successful_acks + local_ok as usize;
        let total = self.replicas.len();

        self.conflicts.release(&ctx.op.target, ctx.op_id);

        if ctx.op.kind().is_write_class() {
            if let Some(handle) = &ctx.handle {
                self.durability.mark_dirty(handle, ctx.meta);
            }
        }

        if self.quorum.post_check(final_acks) {
            if !local_ok {
                tracing::warn!(
                    term = ctx.meta.term,
                    index = ctx.meta.index,
                    kind = ?ctx.op.kind(),
                    acks = final_acks,
                    "local attempt failed but remote quorum met; masking as success"
                );
                return Ok(ctx.successful_op_ret);
            }
            Ok(local_ret)
        } else {
            // Failure discovered after the local attempt: the local
            // replica must also journal the rollback
            self.rollback
                .rollback(ctx.meta, ctx.op.kind(), ctx.op.target, true)
                .await;
            Err(Error::QuorumNotMet {
                reached: final_acks,
                possible: total,
            })
        }
    }

    /// Quorum became unreachable before the local attempt: signal the
    /// peers so divergent remote state can be reconciled later
    async fn fail_before_local(&self, ctx: &OpContext, reached: usize) {
        tracing::warn!(
            term = ctx.meta.term,
            index = ctx.meta.index,
            kind = ?ctx.op.kind(),
            reached,
            "quorum unreachable, failing without local attempt"
        );
        self.rollback
            .rollback(ctx.meta, ctx.op.kind(), ctx.op.target, false)
            .await;
    }
}
