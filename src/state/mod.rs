//! Replica State Module
//!
//! Tracks replica liveness, quorum, and the local leader/follower role.

mod membership;

pub use membership::{quorum_met, AvailabilityEvent, QuorumTracker, Role};
