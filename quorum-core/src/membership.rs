//! Cluster membership adapter. Kept as two separated interfaces, a
//! read-only status view and a command sink, so the core can be tested
//! with a fake. The real collaborator (a cluster membership client such
//! as CMAN) lives outside this crate; `quorum-core` only defines the
//! seam.

use std::collections::HashSet;

use crate::types::NodeId;

/// Read-only polling surface: this node's id, the live member set, and a
/// liveness check the loop polls once per cycle. The collaborator is
/// responsible for detecting its own liveness.
pub trait ClusterStatus: Send {
    fn my_node_id(&self) -> NodeId;

    /// Node ids the surrounding cluster currently considers members.
    /// Intersected with our observed mask before publishing `master_mask`.
    fn live_members(&self) -> HashSet<NodeId>;

    /// `false` means the collaborator itself is down; the loop halts and
    /// exits non-zero.
    fn is_alive(&self) -> bool;
}

/// Mutating surface: reporting our vote and requesting fencing/leave.
pub trait ClusterCommands: Send {
    fn report_quorum_device_vote(&self, have_vote: bool);

    /// Only called when `allow_kill` is configured.
    fn request_kill_node(&self, node: NodeId);

    /// Only called when `stop_cman` is configured.
    fn request_leave_cluster(&self);
}

/// In-memory fake implementing both seams, for tests that drive the
/// quorum loop and election engine without a real cluster membership
/// client.
pub struct FakeMembership {
    my_id: NodeId,
    live: std::sync::Mutex<HashSet<NodeId>>,
    alive: std::sync::atomic::AtomicBool,
    votes: std::sync::Mutex<Vec<bool>>,
    kills: std::sync::Mutex<Vec<NodeId>>,
    leaves: std::sync::atomic::AtomicU32,
}

impl FakeMembership {
    pub fn new(my_id: NodeId, live: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            my_id,
            live: std::sync::Mutex::new(live.into_iter().collect()),
            alive: std::sync::atomic::AtomicBool::new(true),
            votes: std::sync::Mutex::new(Vec::new()),
            kills: std::sync::Mutex::new(Vec::new()),
            leaves: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn set_live(&self, live: impl IntoIterator<Item = NodeId>) {
        *self.live.lock().unwrap() = live.into_iter().collect();
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn votes(&self) -> Vec<bool> {
        self.votes.lock().unwrap().clone()
    }

    pub fn last_vote(&self) -> Option<bool> {
        self.votes.lock().unwrap().last().copied()
    }

    pub fn kills(&self) -> Vec<NodeId> {
        self.kills.lock().unwrap().clone()
    }

    pub fn leave_requests(&self) -> u32 {
        self.leaves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl ClusterStatus for FakeMembership {
    fn my_node_id(&self) -> NodeId {
        self.my_id
    }

    fn live_members(&self) -> HashSet<NodeId> {
        self.live.lock().unwrap().clone()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl ClusterCommands for FakeMembership {
    fn report_quorum_device_vote(&self, have_vote: bool) {
        self.votes.lock().unwrap().push(have_vote);
    }

    fn request_kill_node(&self, node: NodeId) {
        self.kills.lock().unwrap().push(node);
    }

    fn request_leave_cluster(&self) {
        self.leaves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_membership_records_votes_and_kills() {
        let m = FakeMembership::new(1, [1, 2, 3]);
        assert_eq!(m.my_node_id(), 1);
        assert!(m.is_alive());
        m.report_quorum_device_vote(true);
        m.request_kill_node(2);
        assert_eq!(m.last_vote(), Some(true));
        assert_eq!(m.kills(), vec![2]);
    }
}
