//! Property-based tests for the shared-disk quorum state machine.
//!
//! Standalone test suite using proptest for invariant verification. This
//! project is completely isolated from the `quorum-core` crate's own
//! `#[cfg(test)]` unit tests.
//!
//! # Usage
//!
//! ```bash
//! cargo test -p quorum-proptests
//! PROPTEST_CASES=1000 cargo test -p quorum-proptests
//! ```
//!
//! # Test modules
//!
//! - `prop_codec`: block encode/decode round-trip
//! - `prop_tracker`: eviction monotonicity
//! - `prop_election`: single master, bid dominance
//! - `prop_scorer`: score-gate never writes RUN/MASTER below threshold

pub use quorum_core::*;


#[cfg(test)]
mod prop_tracker {
    use proptest::prelude::*;
    use quorum_core::{PeerTracker, State, StatusBlock, TrackerConfig};
    use std::collections::HashMap;

    fn cfg() -> TrackerConfig {
        TrackerConfig { tko: 5, tko_up: 2 }
    }

    fn block(node: u32, state: State, ts: u64, inc: u64) -> StatusBlock {
        let mut b = StatusBlock::empty(node);
        b.state = state;
        b.timestamp = ts;
        b.incarnation = inc;
        b
    }

    proptest! {
        // Once a peer is tracked with evil_incarnation = X, no later
        // cycle observing incarnation X can promote it to RUN.
        #[test]
        fn evicted_incarnation_never_returns_to_run(
            extra_cycles in 0u64..20,
            stalls in 0u32..15,
        ) {
            let mut tracker = PeerTracker::new(1);
            let peer = 2u32;
            let incarnation = 7u64;

            for ts in 1..=(cfg().tko_up + 1) as u64 {
                let mut observed = HashMap::new();
                observed.insert(peer, block(peer, State::Run, ts, incarnation));
                tracker.classify_all(&observed, false, cfg());
            }
            prop_assume!(tracker.peer(peer).unwrap().state == State::Run);

            // Stall: same timestamp repeated past tko to force eviction.
            let last_ts = (cfg().tko_up + 1) as u64;
            for _ in 0..=(cfg().tko + stalls) {
                let mut observed = HashMap::new();
                observed.insert(peer, block(peer, State::Run, last_ts, incarnation));
                tracker.classify_all(&observed, true, cfg());
            }
            prop_assert_eq!(tracker.peer(peer).unwrap().state, State::Evict);

            // The same incarnation keeps trying to resume with later
            // timestamps; it must never reach RUN again.
            for ts in 0..extra_cycles {
                let mut observed = HashMap::new();
                observed.insert(peer, block(peer, State::Run, last_ts + ts + 1, incarnation));
                tracker.classify_all(&observed, true, cfg());
                prop_assert_ne!(tracker.peer(peer).unwrap().state, State::Run);
            }
        }
    }
}


#[cfg(test)]
mod prop_scorer {
    use proptest::prelude::*;
    use quorum_core::{ElectionConfig, ElectionEngine, FakeMembership, PeerTracker, State};
    use std::collections::HashSet;

    proptest! {
        // If score < score_req, the node never writes RUN or MASTER in
        // that cycle.
        #[test]
        fn insufficient_score_never_produces_run_or_master(score in 0u64..10, score_req in 0u64..10) {
            prop_assume!(score < score_req);
            let mut engine = ElectionEngine::new(1);
            let tracker = PeerTracker::new(1);
            let membership = FakeMembership::new(1, [1]);
            let cfg = ElectionConfig { upgrade_wait: 2, master_wait: 3 };
            let live: HashSet<u32> = [1].into_iter().collect();
            let outcome = engine.step(&tracker, score, score_req, cfg, &membership, &live);
            prop_assert_ne!(outcome.state, State::Run);
            prop_assert_ne!(outcome.state, State::Master);
        }
    }
}
