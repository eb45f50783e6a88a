//! Replication Protocol
//!
//! Defines the operation model shared by the fan-out engine, the rollback
//! coordinator, and the journal, plus the wire messages exchanged with
//! replicas and the transport trait the engine drives.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Journal term number
pub type Term = u64;

/// Per-term operation index
pub type OpIndex = u64;

/// Global file identity, stable across all replicas
pub type FileId = Uuid;

/// Mutating file-operation kinds replicated through the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FopKind {
    Write,
    Truncate,
    Fallocate,
    Discard,
    Zerofill,
    SetAttr,
    SetXattr,
    RemoveXattr,
    Create,
    Mkdir,
    Symlink,
    Link,
    Rename,
    Unlink,
    Rmdir,
    Fsync,
}

impl FopKind {
    /// Write-class operations leave a dirty marker on the open handle
    /// that the durability batcher later forces to disk
    pub fn is_write_class(&self) -> bool {
        matches!(
            self,
            FopKind::Write
                | FopKind::Truncate
                | FopKind::Fallocate
                | FopKind::Discard
                | FopKind::Zerofill
        )
    }
}

/// Arguments of a mutating operation, one variant per fop kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpArgs {
    Write { offset: u64, data: Bytes },
    Truncate { size: u64 },
    Fallocate { offset: u64, len: u64, keep_size: bool },
    Discard { offset: u64, len: u64 },
    Zerofill { offset: u64, len: u64 },
    SetAttr { valid: u32, mode: u32, uid: u32, gid: u32 },
    SetXattr { xattrs: Vec<(String, Vec<u8>)>, flags: u32 },
    RemoveXattr { name: String },
    Create { parent: FileId, name: String, mode: u32 },
    Mkdir { parent: FileId, name: String, mode: u32 },
    Symlink { parent: FileId, name: String, link_target: String },
    Link { parent: FileId, name: String },
    Rename { new_parent: FileId, new_name: String },
    Unlink { parent: FileId, name: String },
    Rmdir { parent: FileId, name: String },
    Fsync { datasync: bool },
}

impl OpArgs {
    /// The kind tag for this operation's arguments
    pub fn kind(&self) -> FopKind {
        match self {
            OpArgs::Write { .. } => FopKind::Write,
            OpArgs::Truncate { .. } => FopKind::Truncate,
            OpArgs::Fallocate { .. } => FopKind::Fallocate,
            OpArgs::Discard { .. } => FopKind::Discard,
            OpArgs::Zerofill { .. } => FopKind::Zerofill,
            OpArgs::SetAttr { .. } => FopKind::SetAttr,
            OpArgs::SetXattr { .. } => FopKind::SetXattr,
            OpArgs::RemoveXattr { .. } => FopKind::RemoveXattr,
            OpArgs::Create { .. } => FopKind::Create,
            OpArgs::Mkdir { .. } => FopKind::Mkdir,
            OpArgs::Symlink { .. } => FopKind::Symlink,
            OpArgs::Link { .. } => FopKind::Link,
            OpArgs::Rename { .. } => FopKind::Rename,
            OpArgs::Unlink { .. } => FopKind::Unlink,
            OpArgs::Rmdir { .. } => FopKind::Rmdir,
            OpArgs::Fsync { .. } => FopKind::Fsync,
        }
    }
}

/// A mutating operation against one target file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Target file identity
    pub target: FileId,
    /// Operation arguments
    pub args: OpArgs,
}

impl Operation {
    pub fn kind(&self) -> FopKind {
        self.args.kind()
    }
}

/// Per-operation metadata carried on every replicated call for journal
/// correlation and role gating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMeta {
    /// Journal term the operation belongs to
    pub term: Term,
    /// Monotonic index within the term
    pub index: OpIndex,
    /// Present on calls fanned out by the leader
    pub from_leader: bool,
    /// Present on calls replayed by the reconciliation pass
    pub reconciling: bool,
}

/// Reply from a single replica for a single operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaReply {
    /// Whether the replica applied the operation
    pub success: bool,
    /// Operation return value (valid when `success`)
    pub op_ret: i64,
    /// Errno-style failure code (valid when `!success`)
    pub op_errno: i32,
    /// Reply metadata, flat key/value pairs
    pub xdata: Vec<(String, Vec<u8>)>,
}

impl ReplicaReply {
    /// A successful reply carrying a return value
    pub fn ok(op_ret: i64) -> Self {
        Self {
            success: true,
            op_ret,
            op_errno: 0,
            xdata: Vec::new(),
        }
    }

    /// A failed reply carrying an errno
    pub fn fail(op_errno: i32) -> Self {
        Self {
            success: false,
            op_ret: -1,
            op_errno,
            xdata: Vec::new(),
        }
    }
}

/// Wire messages exchanged between replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Replicated file operation (leader to follower)
    Fop { meta: OpMeta, op: Operation },

    /// Reply to a replicated operation
    FopReply {
        term: Term,
        index: OpIndex,
        reply: ReplicaReply,
    },

    /// Out-of-band compensating signal after a quorum failure; journaled
    /// by the receiver for the reconciliation pass
    Rollback {
        meta: OpMeta,
        failed_kind: FopKind,
        target: FileId,
    },

    /// Unconditional durability request for one file
    Flush { target: FileId },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Fop { .. } => "Fop",
            Message::FopReply { .. } => "FopReply",
            Message::Rollback { .. } => "Rollback",
            Message::Flush { .. } => "Flush",
        }
    }
}

/// Transport to one replica.
///
/// Implementations must be safe to invoke concurrently for distinct
/// replicas and carry no ordering obligations between in-flight calls on
/// the same file; ordering is the engine's responsibility.
#[async_trait::async_trait]
pub trait Replica: Send + Sync {
    /// Replica name for logging
    fn name(&self) -> &str;

    /// Send one operation and await its reply. Transport-level failure
    /// is an `Err`; a replica that rejected the operation is an `Ok`
    /// reply with `success == false`.
    async fn send(&self, meta: OpMeta, op: &Operation) -> Result<ReplicaReply>;

    /// Best-effort control-plane message (rollback signaling)
    async fn send_control(&self, msg: &Message) -> Result<()>;

    /// Force pending writes on one file durable
    async fn flush(&self, target: FileId) -> Result<()>;
}

/// The ordered, fixed replica set. Index 0 is the local replica; the
/// rest are remote peers. Immutable for the process lifetime.
pub struct ReplicaSet {
    replicas: Vec<Arc<dyn Replica>>,
}

impl ReplicaSet {
    /// Build the replica topology. Failing here is the only fatal
    /// startup condition in this layer.
    pub fn new(replicas: Vec<Arc<dyn Replica>>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(Error::Config("no local replica configured".into()));
        }
        if replicas.len() < 2 {
            return Err(Error::Config("no remote replicas configured".into()));
        }
        Ok(Self { replicas })
    }

    /// Total replica count, local included
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// The local replica
    pub fn local(&self) -> &Arc<dyn Replica> {
        &self.replicas[0]
    }

    /// Remote replicas, in index order
    pub fn remotes(&self) -> &[Arc<dyn Replica>] {
        &self.replicas[1..]
    }

    /// All replicas, local first
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Replica>> {
        self.replicas.iter()
    }
}
