//! Rollback Coordinator
//!
//! When quorum fails, an out-of-band compensating signal is sent to the
//! replicas. Receivers journal the signal with the failed operation's
//! term and index so the reconciliation pass can later undo or reapply
//! divergent state. The signal is forward progress only: it bypasses the
//! conflict queue, triggers no quorum evaluation, and its own failure is
//! logged rather than retried.

use std::sync::Arc;

use futures::future::join_all;

use super::protocol::{FileId, FopKind, Message, OpMeta, ReplicaSet};

/// Emits rollback signals after a failed quorum decision
pub struct RollbackCoordinator {
    replicas: Arc<ReplicaSet>,
}

impl RollbackCoordinator {
    pub fn new(replicas: Arc<ReplicaSet>) -> Self {
        Self { replicas }
    }

    /// Send a rollback tagged with the failed operation's kind, target,
    /// term and index. `include_local` is set when the failure was
    /// discovered after the leader's own attempt, so the local replica
    /// must also journal the signal.
    pub async fn rollback(
        &self,
        meta: OpMeta,
        failed_kind: FopKind,
        target: FileId,
        include_local: bool,
    ) {
        let msg = Message::Rollback {
            meta: OpMeta {
                from_leader: true,
                ..meta
            },
            failed_kind,
            target,
        };

        tracing::warn!(
            term = meta.term,
            index = meta.index,
            ?failed_kind,
            include_local,
            "sending rollback signal"
        );

        let sends = self
            .replicas
            .iter()
            .skip(if include_local { 0 } else { 1 })
            .map(|replica| {
                let msg = msg.clone();
                async move {
                    if let Err(e) = replica.send_control(&msg).await {
                        tracing::warn!(
                            replica = replica.name(),
                            error = %e,
                            "rollback send failed (best-effort, not retried)"
                        );
                    }
                }
            });

        join_all(sends).await;
    }
}
