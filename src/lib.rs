//! Brickline - Journal-Based Replication for Distributed File Volumes
//!
//! A leader-driven replication layer for a replicated file volume: one
//! brick per node, one leader fanning mutating operations out to its
//! followers and deciding success by quorum.
//!
//! # Architecture
//!
//! The leader serializes conflicting operations per file, fans each
//! operation out to the remote bricks, and checks quorum twice: an
//! optimistic check before the local attempt and a final check after
//! it. Failed decisions emit rollback signals that the receiving bricks
//! journal; a later reconciliation pass replays the term journal to
//! converge diverged bricks.
//!
//! # Features
//!
//! - Liveness-driven leader/follower role with quorum gating
//! - Per-file conflict queue preserving issue order
//! - Parallel fan-out with fail-fast quorum pre-checks
//! - Best-effort rollback signaling on failed decisions
//! - Batched durability with per-handle dirty markers
//! - Fixed-record term journal with replay and hole detection

pub mod config;
pub mod error;
pub mod state;
pub mod replication;
pub mod durability;
pub mod journal;

pub use config::BricklineConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::BricklineConfig;
    pub use crate::durability::{DurabilityBatcher, OpenHandle};
    pub use crate::error::{Error, Result};
    pub use crate::journal::{ReplayCursor, TermRange};
    pub use crate::replication::{
        Message, OpMeta, Operation, Replica, ReplicaSet, ReplicationEngine,
    };
    pub use crate::state::{QuorumTracker, Role};
}
