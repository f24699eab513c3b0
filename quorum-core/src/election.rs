//! The bid/ack/nack protocol piggy-backed on status blocks, picking the
//! lowest-id master with no communication channel beyond the shared disk.

use crate::bitmap::Bitmap;
use crate::membership::ClusterCommands;
use crate::tracker::PeerTracker;
use crate::types::{Msg, MsgKind, NodeId, State};
use tracing::{debug, info, warn};

/// Outcome of the master-existence scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterInfo {
    /// Any id whose tracked state is `>= RUN` and whose observed block
    /// claims `MASTER` (self-match allowed). `None` if no master is
    /// visible. Ties are broken toward the lowest id for determinism;
    /// at steady state there is at most one anyway.
    pub master: Option<NodeId>,
    /// How many distinct nodes claim `MASTER` right now (normally 0 or 1;
    /// more than 1 is the conflict the decision table's abdicate row
    /// resolves).
    pub count: u32,
    /// The minimum id among nodes tracked `== RUN` (master excluded, since
    /// a master never re-enters the bidding pool), defaulting to this
    /// node's id when this node itself is not `RUN`.
    pub low_id: NodeId,
}

/// Vote-tallying outcome, in priority order: an all-acked bid wins
/// outright, a nack clears it, a lower-id competing bid pre-empts it, and
/// otherwise we keep waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteOutcome {
    /// Every running peer has acked us.
    AllAcked,
    /// Someone nacked us.
    Nacked,
    /// A lower-id peer is also bidding; we already switched our message
    /// to ack it inside `check_votes`.
    PreEmpted,
    /// Keep waiting.
    Waiting,
}

/// The election engine's own local state: the one-slot message it
/// publishes, and the role/bidding bookkeeping.
pub struct ElectionEngine {
    my_id: NodeId,
    state: State,
    msg: Msg,
    seq: u32,
    bid_pending: u32,
    upgrade_wait: u32,
}

/// Tunables the engine needs from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ElectionConfig {
    pub upgrade_wait: u32,
    pub master_wait: u32,
}

/// What the quorum loop must do with the engine's decision this cycle:
/// whether our own mask bit is set, and the mask to publish if we are
/// MASTER.
#[derive(Debug, Clone)]
pub struct ElectionOutcome {
    pub state: State,
    pub msg: Msg,
    pub own_bit_set: bool,
    /// `Some(mask)` only when `state == Master` this cycle.
    pub master_mask: Option<Bitmap>,
    /// Set when the score gate just downgraded us from a participating
    /// state to NONE. The loop reboots if `reboot` is configured.
    pub reboot_requested: bool,
}

impl ElectionEngine {
    pub fn new(my_id: NodeId) -> Self {
        Self { my_id, state: State::None, msg: Msg::none(), seq: 0, bid_pending: 0, upgrade_wait: 0 }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn msg(&self) -> Msg {
        self.msg
    }

    /// Used only by the loop's initialization phase to publish `INIT`
    /// without engaging the bidding machinery.
    pub fn set_state_init(&mut self) {
        self.state = State::Init;
    }

    fn bump_msg(&mut self, kind: MsgKind, arg: NodeId) {
        self.seq += 1;
        self.msg = Msg { kind, arg, seq: self.seq };
    }

    /// Scan for who, if anyone, is currently publishing MASTER.
    fn master_exists(&self, tracker: &PeerTracker) -> MasterInfo {
        let mut masters: Vec<NodeId> = Vec::new();
        if self.state == State::Master {
            masters.push(self.my_id);
        }
        let mut low_id = if self.state == State::Run { self.my_id } else { u32::MAX };

        for (&id, rec) in tracker.peers() {
            if rec.state >= State::Run && rec.status.state == State::Master {
                masters.push(id);
            } else if rec.state == State::Run && id < low_id {
                low_id = id;
            }
        }

        let low_id = if low_id == u32::MAX { self.my_id } else { low_id };
        let master = masters.iter().copied().min();
        MasterInfo { master, count: masters.len() as u32, low_id }
    }

    /// Ack the lowest bidder with an id below ours, if any.
    fn do_vote(&self, tracker: &PeerTracker) -> Option<Msg> {
        let mut best: Option<(NodeId, u32)> = None;
        for (&id, rec) in tracker.peers() {
            if rec.state != State::Run {
                continue;
            }
            if rec.msg.kind == MsgKind::Bid && id < self.my_id {
                let better = match best {
                    Some((b, _)) => id < b,
                    None => true,
                };
                if better {
                    best = Some((id, rec.msg.seq));
                }
            }
        }
        best.map(|(candidate, seq)| Msg { kind: MsgKind::Ack, arg: candidate, seq })
    }

    /// Tally acks/nacks against our outstanding bid. May rewrite `self.msg`
    /// in place: the pre-empted case acks the lowest bidder instead.
    fn check_votes(&mut self, tracker: &PeerTracker) -> VoteOutcome {
        let mut acks = 0u32;
        let mut nacks = 0u32;
        let mut low_id = self.my_id;
        let mut preempt: Option<(NodeId, u32)> = None;

        for (&id, rec) in tracker.peers() {
            if !rec.state.is_runnable() {
                continue;
            }
            if rec.msg.kind == MsgKind::Ack && rec.msg.arg == self.my_id {
                acks += 1;
            }
            if rec.msg.kind == MsgKind::Nack && rec.msg.arg == self.my_id {
                nacks += 1;
            }
            if rec.msg.kind == MsgKind::Bid && id < low_id {
                low_id = id;
                preempt = Some((id, rec.msg.seq));
            }
        }

        // "running" for the all-acked comparison is every runnable peer;
        // acks must match that count exactly.
        let running = tracker.peers().filter(|(_, r)| r.state.is_runnable()).count() as u32;

        if acks == running {
            return VoteOutcome::AllAcked;
        }
        if nacks > 0 {
            return VoteOutcome::Nacked;
        }
        if let Some((candidate, seq)) = preempt {
            self.msg = Msg { kind: MsgKind::Ack, arg: candidate, seq };
            return VoteOutcome::PreEmpted;
        }
        VoteOutcome::Waiting
    }

    /// Run one cycle of the election decision chain. `score`/`score_req`
    /// come from the scorer (already sampled this cycle); `tracker`
    /// reflects this cycle's peer classification. `commands` receives the
    /// vote-reporting and fencing side effects; the caller decides whether
    /// `reboot_requested` on the outcome actually triggers a reboot.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        tracker: &PeerTracker,
        score: u64,
        score_req: u64,
        cfg: ElectionConfig,
        commands: &dyn ClusterCommands,
        live_members: &std::collections::HashSet<NodeId>,
    ) -> ElectionOutcome {
        let own_bit_set;
        let mut should_reboot = false;

        // Score gate.
        if score < score_req {
            if self.state > State::None {
                info!(score, score_req, "score insufficient for master operation; downgrading");
                self.state = State::None;
                self.bump_msg(MsgKind::None, 0);
                self.bid_pending = 0;
                self.upgrade_wait = 0;
                commands.report_quorum_device_vote(false);
                should_reboot = true;
            }
            own_bit_set = false;
        } else {
            own_bit_set = true;
            if self.state == State::None {
                info!(score, score_req, "score sufficient for master operation; upgrading");
                self.state = State::Run;
                self.upgrade_wait = cfg.upgrade_wait;
                self.bid_pending = 0;
                self.bump_msg(MsgKind::None, 0);
            }
        }

        if self.upgrade_wait > 0 {
            self.upgrade_wait -= 1;
        }

        let mut info = self.master_exists(tracker);

        // Resolve a master conflict: we think we're master, someone else
        // disagrees.
        if self.state == State::Master && info.master != Some(self.my_id) {
            warn!(detected = ?info.master, "master conflict: abdicating");
            self.state = State::Run;
            self.upgrade_wait = cfg.upgrade_wait;
            self.bid_pending = 0;
            self.bump_msg(MsgKind::None, 0);
            info = self.master_exists(tracker);
        }

        let mut master_mask = None;

        if info.master.is_none() && info.low_id == self.my_id && self.state == State::Run && self.bid_pending == 0 && self.upgrade_wait == 0 {
            // We are the lowest runnable id and no master exists: bid.
            debug!("making bid for master");
            self.bump_msg(MsgKind::Bid, 0);
            self.bid_pending = 1;
        } else if info.master.is_none() && self.bid_pending == 0 {
            // No master, not bidding ourselves: vote for someone else's
            // bid, if any.
            if let Some(ack) = self.do_vote(tracker) {
                self.msg = ack;
            }
        } else if info.master.is_none() && self.bid_pending > 0 {
            // We are bidding; tally votes.
            self.bid_pending += 1;
            match self.check_votes(tracker) {
                VoteOutcome::AllAcked => {
                    if self.bid_pending >= cfg.master_wait {
                        info!("assuming master role");
                        self.state = State::Master;
                        self.bump_msg(MsgKind::None, 0);
                        self.bid_pending = 0;
                    }
                    // else: keep waiting for late joiners to be observed.
                }
                VoteOutcome::Nacked => {
                    self.bump_msg(MsgKind::None, 0);
                    self.bid_pending = 0;
                }
                VoteOutcome::PreEmpted => {
                    self.bid_pending = 0;
                }
                VoteOutcome::Waiting => {}
            }
        } else if self.state == State::Master && info.master == Some(self.my_id) {
            // We are the master: publish mask intersected with live
            // members.
            let mut mask = Bitmap::new();
            for (&id, rec) in tracker.peers() {
                if rec.state.is_runnable() {
                    mask.set(id);
                }
            }
            mask.set(self.my_id);
            let disk_only: Vec<NodeId> = mask.iter().filter(|id| !live_members.contains(id)).collect();
            if !disk_only.is_empty() {
                // Persistent disagreement between the disk and the
                // cluster-membership collaborator has no reconciliation
                // here, only exclusion from the published mask.
                warn!(?disk_only, "nodes writing the disk are absent from live_members; excluding from master_mask");
            }
            mask.intersect(&Bitmap::from_nodes(live_members.iter().copied()));
            master_mask = Some(mask);
            commands.report_quorum_device_vote(true);
        } else if self.state == State::Run && info.master.is_some() && info.master != Some(self.my_id) {
            // A master exists elsewhere; check whether it has counted us
            // in its published mask.
            if let Some(master_id) = info.master {
                if let Some(rec) = tracker.peer(master_id) {
                    if rec.status.master_mask.test(self.my_id) {
                        commands.report_quorum_device_vote(true);
                    }
                }
            }
        }

        ElectionOutcome { state: self.state, msg: self.msg, own_bit_set, master_mask, reboot_requested: should_reboot }
    }

    /// Log out: write NONE, clear message/mask, idempotently. Calling this
    /// twice writes NONE twice with non-decreasing `seq`.
    pub fn logout(&mut self) {
        self.state = State::None;
        self.bump_msg(MsgKind::None, 0);
        self.bid_pending = 0;
        self.upgrade_wait = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StatusBlock;
    use crate::membership::FakeMembership;
    use crate::tracker::{PeerTracker, TrackerConfig};
    use std::collections::HashMap;

    fn cfg() -> ElectionConfig {
        ElectionConfig { upgrade_wait: 2, master_wait: 3 }
    }

    fn tcfg() -> TrackerConfig {
        TrackerConfig { tko: 10, tko_up: 2 }
    }

    fn live(ids: &[NodeId]) -> std::collections::HashSet<NodeId> {
        ids.iter().copied().collect()
    }

    fn observe(tracker: &mut PeerTracker, blocks: &[(NodeId, State, MsgKind, NodeId, u32, u64)]) {
        let mut observed = HashMap::new();
        for &(id, state, kind, arg, seq, ts) in blocks {
            let mut b = StatusBlock::empty(id);
            b.state = state;
            b.msg = Msg { kind, arg, seq };
            b.timestamp = ts;
            b.incarnation = 1;
            observed.insert(id, b);
        }
        tracker.classify_all(&observed, false, tcfg());
    }

    fn bring_up(tracker: &mut PeerTracker, id: NodeId) {
        for ts in 1..=(tcfg().tko_up + 1) as u64 {
            observe(tracker, &[(id, State::Run, MsgKind::None, 0, 0, ts)]);
        }
        assert_eq!(tracker.peer(id).unwrap().state, State::Run);
    }

    #[test]
    fn score_below_threshold_blocks_promotion() {
        let mut engine = ElectionEngine::new(1);
        let tracker = PeerTracker::new(1);
        let membership = FakeMembership::new(1, [1]);
        let outcome = engine.step(&tracker, 1, 5, cfg(), &membership, &live(&[1]));
        assert_eq!(outcome.state, State::None);
        assert!(!outcome.own_bit_set);
    }

    #[test]
    fn sufficient_score_promotes_none_to_run() {
        let mut engine = ElectionEngine::new(1);
        let tracker = PeerTracker::new(1);
        let membership = FakeMembership::new(1, [1]);
        let outcome = engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1]));
        assert_eq!(outcome.state, State::Run);
        assert!(outcome.own_bit_set);
    }

    #[test]
    fn score_collapse_downgrades_and_reports_no_vote() {
        let mut engine = ElectionEngine::new(1);
        let tracker = PeerTracker::new(1);
        let membership = FakeMembership::new(1, [1]);
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1]));
        let outcome = engine.step(&tracker, 0, 5, cfg(), &membership, &live(&[1]));
        assert_eq!(outcome.state, State::None);
        assert_eq!(membership.last_vote(), Some(false));
    }

    #[test]
    fn lowest_id_bids_when_no_master_present() {
        let mut engine = ElectionEngine::new(1);
        let mut tracker = PeerTracker::new(1);
        bring_up(&mut tracker, 2);
        let membership = FakeMembership::new(1, [1, 2]);
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        // upgrade_wait must elapse before a bid is allowed.
        let mut outcome = engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        outcome = engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        assert_eq!(outcome.msg.kind, MsgKind::Bid);
    }

    #[test]
    fn higher_id_acks_a_lower_bidder() {
        let mut engine = ElectionEngine::new(2);
        let mut tracker = PeerTracker::new(2);
        bring_up(&mut tracker, 1);
        let membership = FakeMembership::new(2, [1, 2]);
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2])); // clears upgrade_wait
        observe(&mut tracker, &[(1, State::Run, MsgKind::Bid, 0, 1, 99)]);
        let outcome = engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        assert_eq!(outcome.msg.kind, MsgKind::Ack);
        assert_eq!(outcome.msg.arg, 1);
    }

    #[test]
    fn all_acks_after_master_wait_becomes_master() {
        let mut engine = ElectionEngine::new(1);
        let mut tracker = PeerTracker::new(1);
        bring_up(&mut tracker, 2);
        let membership = FakeMembership::new(1, [1, 2]);
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2])); // upgrade_wait -> 0
        let outcome = engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        assert_eq!(outcome.msg.kind, MsgKind::Bid);

        // Peer 2 acks us each subsequent cycle; wait out master_wait.
        let mut last = outcome;
        for ts in 10..10 + cfg().master_wait + 1 {
            observe(&mut tracker, &[(2, State::Run, MsgKind::Ack, 1, 1, ts as u64)]);
            last = engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        }
        assert_eq!(last.state, State::Master);
        assert!(last.master_mask.is_some());
    }

    #[test]
    fn nack_clears_the_bid() {
        let mut engine = ElectionEngine::new(1);
        let mut tracker = PeerTracker::new(1);
        bring_up(&mut tracker, 2);
        let membership = FakeMembership::new(1, [1, 2]);
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2])); // bid issued

        observe(&mut tracker, &[(2, State::Run, MsgKind::Nack, 1, 1, 50)]);
        let outcome = engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        assert_eq!(outcome.msg.kind, MsgKind::None);
    }

    #[test]
    fn master_conflict_forces_abdication() {
        let mut engine = ElectionEngine::new(2);
        // Force state to MASTER directly via repeated winning cycles is
        // slow; instead simulate by driving to MASTER with no peers, then
        // introduce a lower-id master.
        let mut tracker = PeerTracker::new(2);
        let membership = FakeMembership::new(2, [1, 2]);
        for _ in 0..4 {
            engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        }
        for ts in 0..cfg().master_wait + 1 {
            engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
            let _ = ts;
        }
        assert_eq!(engine.state(), State::Master);

        bring_up(&mut tracker, 1);
        observe(&mut tracker, &[(1, State::Master, MsgKind::None, 0, 0, 100)]);
        let outcome = engine.step(&tracker, 5, 5, cfg(), &membership, &live(&[1, 2]));
        assert_eq!(outcome.state, State::Run);
    }

    #[test]
    fn logout_is_idempotent_with_non_decreasing_seq() {
        let mut engine = ElectionEngine::new(1);
        engine.logout();
        let seq1 = engine.msg().seq;
        engine.logout();
        let seq2 = engine.msg().seq;
        assert_eq!(engine.state(), State::None);
        assert!(seq2 >= seq1);
    }
}
