//! Stand-in for the real cluster-membership client (a cluster-membership
//! daemon such as CMAN). Lets `quorumd` run standalone: always reports
//! itself alive, treats every node id the operator names on the command
//! line as live, and logs vote/fence/leave requests instead of acting on
//! them.

use std::collections::HashSet;

use quorum_core::{ClusterCommands, ClusterStatus, NodeId};
use tracing::info;

pub struct StubMembership {
    my_id: NodeId,
    live: HashSet<NodeId>,
}

impl StubMembership {
    pub fn new(my_id: NodeId, live: HashSet<NodeId>) -> Self {
        Self { my_id, live }
    }
}

impl ClusterStatus for StubMembership {
    fn my_node_id(&self) -> NodeId {
        self.my_id
    }

    fn live_members(&self) -> HashSet<NodeId> {
        self.live.clone()
    }

    fn is_alive(&self) -> bool {
        true
    }
}

impl ClusterCommands for StubMembership {
    fn report_quorum_device_vote(&self, have_vote: bool) {
        info!(have_vote, "quorum device vote (no cluster-membership client configured)");
    }

    fn request_kill_node(&self, node: NodeId) {
        info!(node, "fencing request (no cluster-membership client configured)");
    }

    fn request_leave_cluster(&self) {
        info!("cluster leave requested (no cluster-membership client configured)");
    }
}
