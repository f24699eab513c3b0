//! Per-peer decayed state inferred from observed status blocks.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::codec::StatusBlock;
use crate::types::{Msg, NodeId, State};

/// Tunables the tracker needs from configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub tko: u32,
    pub tko_up: u32,
}

/// One peer's tracked state.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub status: StatusBlock,
    pub last_seen: u64,
    pub misses: u32,
    pub seen: u32,
    pub incarnation: u64,
    pub evil_incarnation: u64,
    pub state: State,
    pub msg: Msg,
    pub last_msg: Msg,
}

impl PeerRecord {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            status: StatusBlock::empty(node_id),
            last_seen: 0,
            misses: 0,
            seen: 0,
            incarnation: 0,
            evil_incarnation: 0,
            state: State::None,
            msg: Msg::none(),
            last_msg: Msg::none(),
        }
    }
}

/// A directive the quorum loop must carry out against the shared disk or
/// the cluster-membership collaborator on behalf of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    /// Write an EVICT status block into `node`'s sector (only ever emitted
    /// when we are the master).
    WriteEvict { node: NodeId, incarnation: u64 },
    /// Ask the cluster-membership collaborator to fence `node`, gated by
    /// `allow_kill` at the call site.
    RequestFence { node: NodeId },
}

/// Outcome of one cycle's worth of classification across all peers.
#[derive(Debug, Default)]
pub struct ClassifyOutcome {
    /// Our outgoing mask, rebuilt from scratch each cycle per the case
    /// table (every case either sets or clears the peer's bit).
    pub our_mask: Bitmap,
    pub actions: Vec<PeerAction>,
}

/// Tracks every potential peer (`1..=MAX_NODES`, excluding `this_node`).
pub struct PeerTracker {
    this_node: NodeId,
    peers: HashMap<NodeId, PeerRecord>,
}

impl PeerTracker {
    pub fn new(this_node: NodeId) -> Self {
        Self { this_node, peers: HashMap::new() }
    }

    pub fn peer(&self, node: NodeId) -> Option<&PeerRecord> {
        self.peers.get(&node)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&NodeId, &PeerRecord)> {
        self.peers.iter()
    }

    fn record_mut(&mut self, node: NodeId) -> &mut PeerRecord {
        self.peers.entry(node).or_insert_with(|| PeerRecord::new(node))
    }

    /// Node ids tracked as `>= RUN` (i.e. alive in our view), including
    /// ourselves if `include_self` is set. Used for the master-exists scan
    /// and for computing `low_id`.
    pub fn alive_ids(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.state >= State::Run)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Classify every observed peer block this cycle. `is_master` reflects
    /// our own state *before* this cycle's election decisions. `observed`
    /// need not contain every node id: a missing entry means the read
    /// failed and is handled upstream as a transient miss (the caller still
    /// calls `observe` with the *previous* block so `misses` increments
    /// naturally).
    pub fn classify_all(
        &mut self,
        observed: &HashMap<NodeId, StatusBlock>,
        is_master: bool,
        cfg: TrackerConfig,
    ) -> ClassifyOutcome {
        let mut outcome = ClassifyOutcome::default();
        let ids: Vec<NodeId> = observed.keys().copied().filter(|&id| id != self.this_node).collect();
        for peer_id in ids {
            let block = observed[&peer_id];
            self.classify_one(peer_id, block, is_master, cfg, &mut outcome);
        }
        outcome
    }

    fn classify_one(
        &mut self,
        peer_id: NodeId,
        observed: StatusBlock,
        is_master: bool,
        cfg: TrackerConfig,
        outcome: &mut ClassifyOutcome,
    ) {
        let rec = self.record_mut(peer_id);

        rec.last_msg = rec.msg;
        rec.msg = observed.msg;
        rec.status = observed;

        if observed.state > State::None {
            if observed.timestamp == rec.last_seen {
                rec.misses += 1;
            } else {
                rec.misses = 0;
                rec.seen += 1;
                rec.last_seen = observed.timestamp;
            }
        }

        // Case 1: down / restart.
        let came_down = rec.state >= State::Evict && observed.state <= State::Evict;
        let incarnation_changed = rec.incarnation != 0 && rec.incarnation != observed.incarnation;
        if came_down || incarnation_changed {
            let was_evict_trigger = observed.state == State::Evict;
            rec.state = State::None;
            rec.incarnation = 0;
            rec.seen = 0;
            rec.misses = 0;
            if !was_evict_trigger {
                rec.evil_incarnation = 0;
            }
            outcome.our_mask.clear(peer_id);
            return;
        }

        // Case 2: eviction.
        if rec.misses > cfg.tko && observed.state.is_runnable() {
            if is_master {
                outcome.actions.push(PeerAction::WriteEvict { node: peer_id, incarnation: observed.incarnation });
                outcome.actions.push(PeerAction::RequestFence { node: peer_id });
                warn!(node = peer_id, misses = rec.misses, "evicting unresponsive peer");
            }
            rec.state = State::Evict;
            rec.evil_incarnation = observed.incarnation;
            outcome.our_mask.clear(peer_id);
            return;
        }

        // Case 3: undead.
        if rec.evil_incarnation != 0 && observed.incarnation == rec.evil_incarnation {
            warn!(node = peer_id, incarnation = observed.incarnation, "undead peer resumed writing with evicted incarnation");
            if is_master {
                outcome.actions.push(PeerAction::WriteEvict { node: peer_id, incarnation: observed.incarnation });
                outcome.actions.push(PeerAction::RequestFence { node: peer_id });
            }
            outcome.our_mask.clear(peer_id);
            return;
        }

        // Case 4: come-up.
        if rec.seen > cfg.tko_up && !rec.state.is_runnable() {
            rec.state = State::Run;
            rec.incarnation = observed.incarnation;
            debug!(node = peer_id, "peer admitted to RUN");
            outcome.our_mask.set(peer_id);
            return;
        }

        // Case 5: master promotion.
        if rec.state == State::Run && observed.state == State::Master {
            rec.state = State::Master;
            outcome.our_mask.set(peer_id);
            return;
        }

        // Case 6: default.
        if rec.state.is_runnable() {
            rec.state = observed.state;
            outcome.our_mask.set(peer_id);
        } else {
            outcome.our_mask.clear(peer_id);
        }
    }

    /// Clear a peer's tracked state on a clean local logout observation,
    /// used only in tests/simulation harnesses that drive the tracker
    /// directly rather than through a full disk round-trip.
    #[cfg(test)]
    fn set_record(&mut self, node: NodeId, rec: PeerRecord) {
        self.peers.insert(node, rec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TrackerConfig {
        TrackerConfig { tko: 3, tko_up: 2 }
    }

    fn block(node: NodeId, state: State, ts: u64, inc: u64) -> StatusBlock {
        let mut b = StatusBlock::empty(node);
        b.state = state;
        b.timestamp = ts;
        b.incarnation = inc;
        b
    }

    #[test]
    fn peer_comes_up_after_tko_up_unique_heartbeats() {
        let mut tracker = PeerTracker::new(1);
        for ts in 1..=3u64 {
            let mut observed = HashMap::new();
            observed.insert(2, block(2, State::Run, ts, 42));
            tracker.classify_all(&observed, false, cfg());
        }
        assert_eq!(tracker.peer(2).unwrap().state, State::Run);
    }

    #[test]
    fn stalled_timestamp_increments_misses_and_eventually_evicts() {
        let mut tracker = PeerTracker::new(1);
        for ts in 1..=3u64 {
            let mut observed = HashMap::new();
            observed.insert(2, block(2, State::Run, ts, 42));
            tracker.classify_all(&observed, false, cfg());
        }
        assert_eq!(tracker.peer(2).unwrap().state, State::Run);

        // Same timestamp repeated: misses climb without the peer advancing.
        for _ in 0..=cfg().tko {
            let mut observed = HashMap::new();
            observed.insert(2, block(2, State::Run, 3, 42));
            tracker.classify_all(&observed, true, cfg());
        }
        assert_eq!(tracker.peer(2).unwrap().state, State::Evict);
        assert_eq!(tracker.peer(2).unwrap().evil_incarnation, 42);
    }

    #[test]
    fn undead_peer_is_re_evicted_without_transition() {
        let mut tracker = PeerTracker::new(1);
        tracker.set_record(2, PeerRecord {
            state: State::Evict,
            evil_incarnation: 42,
            incarnation: 0,
            ..PeerRecord::new(2)
        });

        let mut observed = HashMap::new();
        observed.insert(2, block(2, State::Run, 99, 42));
        let outcome = tracker.classify_all(&observed, true, cfg());

        assert_eq!(tracker.peer(2).unwrap().state, State::Evict);
        assert!(outcome.actions.contains(&PeerAction::WriteEvict { node: 2, incarnation: 42 }));
        assert!(!outcome.our_mask.test(2));
    }

    #[test]
    fn clean_restart_clears_evil_incarnation() {
        let mut tracker = PeerTracker::new(1);
        tracker.set_record(2, PeerRecord {
            state: State::Evict,
            evil_incarnation: 42,
            incarnation: 42,
            last_seen: 5,
            ..PeerRecord::new(2)
        });

        // Peer writes NONE (clean shutdown), not EVICT, with a new incarnation.
        let mut observed = HashMap::new();
        observed.insert(2, block(2, State::None, 6, 43));
        tracker.classify_all(&observed, false, cfg());

        assert_eq!(tracker.peer(2).unwrap().state, State::None);
        assert_eq!(tracker.peer(2).unwrap().evil_incarnation, 0);
    }

    #[test]
    fn master_promotion_requires_prior_run() {
        let mut tracker = PeerTracker::new(1);
        tracker.set_record(2, PeerRecord { state: State::Run, ..PeerRecord::new(2) });

        let mut observed = HashMap::new();
        observed.insert(2, block(2, State::Master, 10, 1));
        let outcome = tracker.classify_all(&observed, false, cfg());

        assert_eq!(tracker.peer(2).unwrap().state, State::Master);
        assert!(outcome.our_mask.test(2));
    }

    #[test]
    fn evicted_peer_still_publishing_master_is_not_readmitted() {
        // EVICT bias: a peer tracked as EVICT that is still publishing
        // MASTER must not be silently re-admitted until a clean shutdown
        // is observed.
        let mut tracker = PeerTracker::new(1);
        tracker.set_record(2, PeerRecord {
            state: State::Evict,
            evil_incarnation: 42,
            incarnation: 42,
            ..PeerRecord::new(2)
        });

        let mut observed = HashMap::new();
        observed.insert(2, block(2, State::Master, 10, 42));
        tracker.classify_all(&observed, true, cfg());

        assert_eq!(tracker.peer(2).unwrap().state, State::Evict);
    }
}
