//! Brickline Error Types

use thiserror::Error;

/// Result type alias for brickline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Brickline error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Quorum and role errors
    #[error("Quorum not met: {reached} of {possible} replicas agreed")]
    QuorumNotMet { reached: usize, possible: usize },

    #[error("Not leader: mutating call must be routed through the leader")]
    NotLeader,

    // Per-call state errors
    #[error("Failed to allocate call state: {0}")]
    AllocationFailure(String),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Replica {index} unreachable: {reason}")]
    ReplicaUnreachable { index: usize, reason: String },

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Journal scanner errors
    #[error("No term segments found in journal directory")]
    NoSegments,

    #[error("Invalid term segment name: {0}")]
    InvalidSegmentName(String),

    #[error("Truncated record in term {term} at index {index}")]
    TruncatedRecord { term: u64, index: u64 },

    #[error("Term segment {0} unavailable")]
    SegmentUnavailable(u64),

    #[error("Journal record corrupted in term {term} at index {index}: {reason}")]
    RecordCorrupted { term: u64, index: u64, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error can succeed on retry without a membership change
    pub fn is_retryable(&self) -> bool {
        // Quorum and role failures are decided per-operation from current
        // membership; retrying them without a liveness transition cannot
        // change the outcome. Journal corruption and I/O failures need
        // operator intervention, not a retry.
        matches!(
            self,
            Error::ReplicaUnreachable { .. } | Error::Replication(_) | Error::AllocationFailure(_)
        )
    }
}
