//! Replication Module
//!
//! Fan-out replication of file operations from the leader to its
//! replica set: per-file conflict serialization, quorum-gated dispatch
//! and completion, and rollback signaling on failure.

pub mod protocol;
mod conflict;
mod engine;
mod rollback;

pub use conflict::{Admission, ConflictTable, OpId};
pub use engine::ReplicationEngine;
pub use protocol::{
    FileId, FopKind, Message, OpArgs, OpIndex, OpMeta, Operation, Replica, ReplicaReply,
    ReplicaSet, Term,
};
pub use rollback::RollbackCoordinator;
