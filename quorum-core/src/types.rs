//! Core wire and in-memory types for the quorum protocol.

use std::time::{SystemTime, UNIX_EPOCH};

/// 1-based owner identity. Node ids run `1..=MAX_NODES`.
pub type NodeId = u32;

/// Largest node id the disk layout has room for. Sector `i` holds node `i`'s
/// status block, so this also bounds the device size we require.
pub const MAX_NODES: u32 = 128;

/// A node's participation state, mirrored in its status block and in our
/// tracked view of every peer. Ordered `NONE < EVICT < INIT < RUN < MASTER`,
/// so "runnable" is simply `>= INIT` and a peer coming back down through
/// EVICT still compares below anything actually participating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum State {
    /// Not participating.
    None = 0,
    /// Evicted by the master, or self-detected eviction.
    Evict = 1,
    /// Warming up: observing, not yet contending for master.
    Init = 2,
    /// Participating, eligible to bid.
    Run = 3,
    /// Authoritative master.
    Master = 4,
}

impl State {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(State::None),
            1 => Some(State::Evict),
            2 => Some(State::Init),
            3 => Some(State::Run),
            4 => Some(State::Master),
            _ => None,
        }
    }

    /// Anything at or above `INIT` counts as "this node is doing something";
    /// `NONE` and `EVICT` are not runnable.
    pub fn is_runnable(self) -> bool {
        self >= State::Init
    }
}

/// The one-slot outgoing election message piggy-backed on a status block.
/// `Ack`/`Nack` carry the candidate id they refer to in the block's `arg`
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgKind {
    #[default]
    None,
    Bid,
    Ack,
    Nack,
}

impl MsgKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MsgKind::None),
            1 => Some(MsgKind::Bid),
            2 => Some(MsgKind::Ack),
            3 => Some(MsgKind::Nack),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MsgKind::None => 0,
            MsgKind::Bid => 1,
            MsgKind::Ack => 2,
            MsgKind::Nack => 3,
        }
    }
}

/// A single election message slot: kind plus the argument (candidate id) and
/// a per-writer monotonic sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Msg {
    pub kind: MsgKind,
    pub arg: NodeId,
    pub seq: u32,
}

impl Msg {
    pub const fn none() -> Self {
        Self { kind: MsgKind::None, arg: 0, seq: 0 }
    }

    pub fn bid(seq: u32) -> Self {
        Self { kind: MsgKind::Bid, arg: 0, seq }
    }

    pub fn ack(candidate: NodeId, seq: u32) -> Self {
        Self { kind: MsgKind::Ack, arg: candidate, seq }
    }

    pub fn nack(candidate: NodeId, seq: u32) -> Self {
        Self { kind: MsgKind::Nack, arg: candidate, seq }
    }
}

/// Current Unix timestamp in seconds. Status-block `timestamp` fields use
/// this when `use_uptime` is not configured; see [`crate::config::Clock`]
/// for the monotonic alternative.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_is_none_evict_init_run_master() {
        assert!(State::None < State::Evict);
        assert!(State::Evict < State::Init);
        assert!(State::Init < State::Run);
        assert!(State::Run < State::Master);
    }

    #[test]
    fn is_runnable_excludes_none_and_evict() {
        assert!(!State::None.is_runnable());
        assert!(!State::Evict.is_runnable());
        assert!(State::Init.is_runnable());
        assert!(State::Run.is_runnable());
        assert!(State::Master.is_runnable());
    }

    #[test]
    fn state_round_trips_through_u8() {
        for s in [State::None, State::Init, State::Run, State::Master, State::Evict] {
            assert_eq!(State::from_u8(s as u8), Some(s));
        }
        assert_eq!(State::from_u8(200), None);
    }
}
