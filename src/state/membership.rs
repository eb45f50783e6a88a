//! Quorum & Role Management
//!
//! Tracks which replicas are currently reachable, computes quorum
//! decisions, and derives the local leader/follower role from liveness
//! when no fixed role is configured.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Role of a replica in the set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Replica coordinates fan-out and quorum decisions
    Leader,
    /// Replica applies operations forwarded by the leader
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Availability signal propagated to the layer above on quorum-gated
/// liveness transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityEvent {
    /// Enough peers are up to satisfy the pre-check quorum
    Up,
    /// Quorum has been lost
    Down,
}

/// Pure quorum predicate shared by every component.
///
/// Ties resolve in favor of quorum: `agreeing * 100 >= total * percent`,
/// so a 50% fraction over `n - 1` peers requires at least half rather
/// than strictly more, and a 100% fraction never demands more than
/// `total` agreeing replicas.
pub fn quorum_met(total: usize, agreeing: usize, percent: f64) -> bool {
    agreeing as f64 * 100.0 >= total as f64 * percent
}

/// Liveness bitmask and derived role state, guarded by one lock held
/// only for O(1) bookkeeping
struct LivenessState {
    /// Bit i set iff replica i is currently up
    up_mask: u64,
    /// Population count of `up_mask`
    up_count: usize,
    /// Derived or fixed local role
    leader: bool,
    /// Whether an `Up` signal has been propagated and not yet revoked
    available: bool,
}

/// Tracks replica liveness and computes quorum and role decisions.
///
/// Index 0 is the local replica and is marked up at construction; the
/// remaining indices are remote peers whose liveness arrives through
/// `child_up` / `child_down` notifications.
pub struct QuorumTracker {
    /// Total replica count, fixed for the process lifetime
    n_replicas: usize,
    /// Quorum fraction over the `n_replicas - 1` peers, in percent
    quorum_percent: f64,
    /// Fixed role from configuration; `None` derives from liveness
    fixed_leader: Option<bool>,
    /// Liveness bits and derived state
    state: Mutex<LivenessState>,
}

impl QuorumTracker {
    /// Create a tracker for a replica set of `n_replicas` bricks
    pub fn new(n_replicas: usize, quorum_percent: f64, fixed_leader: Option<bool>) -> Self {
        assert!(n_replicas >= 1 && n_replicas <= 64, "unsupported replica count");

        // Local replica is always reachable from this process. With only
        // the local replica up, auto-role starts as leader.
        let leader = fixed_leader.unwrap_or(true);

        Self {
            n_replicas,
            quorum_percent,
            fixed_leader,
            state: Mutex::new(LivenessState {
                up_mask: 1,
                up_count: 1,
                leader,
                available: false,
            }),
        }
    }

    /// Total replica count, local included
    pub fn replica_count(&self) -> usize {
        self.n_replicas
    }

    /// Configured quorum fraction in percent
    pub fn quorum_percent(&self) -> f64 {
        self.quorum_percent
    }

    /// A replica came up
    pub fn child_up(&self, index: usize) -> Option<AvailabilityEvent> {
        self.record_liveness(index, true)
    }

    /// A replica went down
    pub fn child_down(&self, index: usize) -> Option<AvailabilityEvent> {
        self.record_liveness(index, false)
    }

    /// Record a liveness notification for replica `index`.
    ///
    /// Duplicate notifications (no bit transition) are ignored. On a real
    /// transition the auto-role is re-derived, and an availability signal
    /// is returned only when the peer pre-check quorum is first satisfied
    /// (`Up`) or first lost (`Down`), so a partially recovered replica set
    /// never appears available prematurely.
    pub fn record_liveness(&self, index: usize, up: bool) -> Option<AvailabilityEvent> {
        assert!(index < self.n_replicas, "replica index out of range");

        let mut state = self.state.lock().unwrap();
        let bit = 1u64 << index;
        let was_up = state.up_mask & bit != 0;
        if was_up == up {
            tracing::debug!(index, up, "ignoring duplicate liveness notification");
            return None;
        }

        if up {
            state.up_mask |= bit;
            state.up_count += 1;
        } else {
            state.up_mask &= !bit;
            state.up_count -= 1;
        }

        // Auto-role: leader iff this is the only replica currently up.
        // A fixed role from configuration is never overridden.
        let derived = state.up_count == 1 && state.up_mask & 1 != 0;
        let new_leader = self.fixed_leader.unwrap_or(derived);
        if new_leader != state.leader {
            tracing::info!(
                role = %if new_leader { Role::Leader } else { Role::Follower },
                up_count = state.up_count,
                "role changed"
            );
            state.leader = new_leader;
        }

        let peers_up = state.up_count - (state.up_mask & 1) as usize;
        let met = quorum_met(self.n_replicas - 1, peers_up, self.quorum_percent);
        if met != state.available {
            state.available = met;
            let event = if met {
                AvailabilityEvent::Up
            } else {
                AvailabilityEvent::Down
            };
            tracing::info!(?event, peers_up, "availability changed");
            Some(event)
        } else {
            None
        }
    }

    /// Current local role
    pub fn role(&self) -> Role {
        if self.state.lock().unwrap().leader {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    /// Whether this replica currently coordinates mutations
    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().leader
    }

    /// Whether replica `index` is currently up
    pub fn is_up(&self, index: usize) -> bool {
        self.state.lock().unwrap().up_mask & (1u64 << index) != 0
    }

    /// Count of peers (excluding the local replica) currently up
    pub fn up_peers(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.up_count - (state.up_mask & 1) as usize
    }

    /// Pre-check: can an operation attempted now possibly reach quorum?
    /// Evaluated against the peer count, excluding the local replica.
    pub fn pre_check(&self) -> bool {
        quorum_met(self.n_replicas - 1, self.up_peers(), self.quorum_percent)
    }

    /// Post-check: did `agreeing` replicas out of the full set (local
    /// outcome included) satisfy quorum?
    pub fn post_check(&self, agreeing: usize) -> bool {
        quorum_met(self.n_replicas, agreeing, self.quorum_percent)
    }
}
